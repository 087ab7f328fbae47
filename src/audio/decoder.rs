use std::{
    fs::{self, File},
    io,
    path::Path,
    sync::Arc,
};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::DecoderOptions,
    errors::{Error as SymphoniaError, SeekErrorKind},
    formats::{FormatOptions, SeekMode, SeekTo},
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
    units::Time,
};
use tracing::{debug, info, warn};

use super::{
    preset::Preset,
    processor::{ChunkProcessor, ProcessedChunk, TrackLookup},
};
use crate::{
    cache::{ChunkCacheKeys, ChunkKey},
    error::ProcessingError,
};

/// One-pole split between "low" and "high" content.
const LOWPASS_COEFF: f32 = 0.05;
const ENVELOPE_ATTACK: f32 = 0.2;
const ENVELOPE_RELEASE: f32 = 0.002;
const COMPRESSION_THRESHOLD: f32 = 0.5;
/// sample_rate (u32) + channels (u16) + padding
const ARTIFACT_HEADER_LEN: usize = 8;

/// Renders chunks straight from the source file.
///
/// Finished chunks are written next to each other under the cache directory
/// and served from disk on the next request for the same key.
pub struct FileChunkProcessor {
    tracks: Arc<dyn TrackLookup + Send + Sync>,
    keys: ChunkCacheKeys,
    chunk_duration: f64,
    fallback_sample_rate: u32,
    // DSP state carried across calls.
    lowpass: Vec<f32>,
    envelope: f32,
}

impl FileChunkProcessor {
    pub fn new(
        tracks: Arc<dyn TrackLookup + Send + Sync>,
        keys: ChunkCacheKeys,
        chunk_duration: f64,
        fallback_sample_rate: u32,
    ) -> Self {
        info!(
            "🎛️ Procesador de chunks listo ({}s por chunk, artefactos en {})",
            chunk_duration,
            keys.cache_dir().display()
        );
        Self {
            tracks,
            keys,
            chunk_duration,
            fallback_sample_rate,
            lowpass: Vec::new(),
            envelope: 0.0,
        }
    }

    fn render(&mut self, key: &ChunkKey, source: &Path) -> Result<ProcessedChunk, ProcessingError> {
        let start = key.chunk_idx as f64 * self.chunk_duration;
        let window = decode_window(source, start, self.chunk_duration, self.fallback_sample_rate)?;
        if window.samples.is_empty() {
            return Err(ProcessingError::ChunkOutOfRange {
                track_id: key.track_id,
                chunk_idx: key.chunk_idx,
            });
        }

        let mut samples = window.samples;
        self.shape(&mut samples, window.channels as usize, key.preset, key.intensity());
        Ok(ProcessedChunk::new(samples, window.channels, window.sample_rate))
    }

    /// Tone tilt plus a soft compressor driven by a shared envelope follower.
    fn shape(&mut self, samples: &mut [f32], channels: usize, preset: Preset, intensity: f32) {
        if preset == Preset::Original || channels == 0 {
            return;
        }
        let (tilt, low, compression) = preset.shaping();
        let amount = intensity.clamp(0.0, 1.0);
        self.lowpass.resize(channels, 0.0);

        for frame in samples.chunks_mut(channels) {
            for (ch, sample) in frame.iter_mut().enumerate() {
                let lp = &mut self.lowpass[ch];
                *lp += LOWPASS_COEFF * (*sample - *lp);
                let high = *sample - *lp;
                let shaped = *sample + amount * (tilt * high + low * *lp);

                let level = shaped.abs();
                let coeff = if level > self.envelope {
                    ENVELOPE_ATTACK
                } else {
                    ENVELOPE_RELEASE
                };
                self.envelope += coeff * (level - self.envelope);

                let gain = if self.envelope > COMPRESSION_THRESHOLD {
                    1.0 - amount * compression * (1.0 - COMPRESSION_THRESHOLD / self.envelope)
                } else {
                    1.0
                };
                *sample = (shaped * gain).clamp(-1.0, 1.0);
            }
        }
    }
}

impl ChunkProcessor for FileChunkProcessor {
    fn process(&mut self, key: &ChunkKey) -> Result<ProcessedChunk, ProcessingError> {
        if let Some(existing) = self.keys.lookup(self.tracks.as_ref(), key) {
            match read_artifact(&existing) {
                Ok(chunk) => return Ok(chunk.with_artifact(existing)),
                Err(e) => warn!("⚠️ Artefacto corrupto {}: {}", existing.display(), e),
            }
        }

        let source = self
            .tracks
            .filepath_for(key.track_id)
            .ok_or(ProcessingError::TrackNotFound(key.track_id))?;
        let artifact = self.keys.artifact_path(key, &source)?;
        let chunk = self.render(key, &source)?;
        fs::create_dir_all(self.keys.cache_dir())?;
        write_artifact(&artifact, &chunk)?;
        debug!("💾 Chunk renderizado: {} ({} bytes)", key, chunk.size_bytes);
        Ok(chunk.with_artifact(artifact))
    }
}

struct DecodedWindow {
    samples: Vec<f32>,
    channels: u16,
    sample_rate: u32,
}

fn decode_err(e: SymphoniaError) -> ProcessingError {
    ProcessingError::Decode(e.to_string())
}

/// Decodes `duration_secs` of interleaved audio starting at `start_secs`.
fn decode_window(
    path: &Path,
    start_secs: f64,
    duration_secs: f64,
    fallback_sample_rate: u32,
) -> Result<DecodedWindow, ProcessingError> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(decode_err)?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| ProcessingError::Decode("no default track".to_string()))?;
    let track_id = track.id;
    let params = track.codec_params.clone();

    let sample_rate = params.sample_rate.unwrap_or(fallback_sample_rate);
    let channels = params.channels.map(|c| c.count()).unwrap_or(2).max(1);
    let mut decoder = symphonia::default::get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(decode_err)?;

    let frame_samples = |secs: f64| (secs * sample_rate as f64).round() as usize * channels;
    let wanted = frame_samples(duration_secs);
    let mut skip_total = frame_samples(start_secs);

    if start_secs > 0.0 {
        let target = SeekTo::Time {
            time: Time::from(start_secs),
            track_id: Some(track_id),
        };
        match format.seek(SeekMode::Accurate, target) {
            Ok(seeked) => {
                decoder.reset();
                // The reader lands on or before the target; drop the lead-in.
                let lead = seeked.required_ts.saturating_sub(seeked.actual_ts);
                skip_total = match params.time_base {
                    Some(tb) => {
                        let t = tb.calc_time(lead);
                        frame_samples(t.seconds as f64 + t.frac)
                    }
                    None => lead as usize * channels,
                };
            }
            Err(SymphoniaError::SeekError(SeekErrorKind::OutOfRange)) => {
                return Ok(DecodedWindow {
                    samples: Vec::new(),
                    channels: channels as u16,
                    sample_rate,
                });
            }
            Err(e) => debug!("Seek no disponible ({}), decodificando desde el inicio", e),
        }
    }

    let mut skipped = 0usize;
    let mut samples = Vec::with_capacity(wanted);

    while samples.len() < wanted {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(decode_err(e)),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(msg)) => {
                debug!("Paquete corrupto ignorado: {}", msg);
                continue;
            }
            Err(e) => return Err(decode_err(e)),
        };

        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        buffer.copy_interleaved_ref(decoded);
        let mut chunk = buffer.samples();

        if skipped < skip_total {
            let skip = (skip_total - skipped).min(chunk.len());
            skipped += skip;
            chunk = &chunk[skip..];
        }

        let room = wanted - samples.len();
        samples.extend(
            chunk[..chunk.len().min(room)]
                .iter()
                .map(|s| if s.is_finite() { *s } else { 0.0 }),
        );
    }

    Ok(DecodedWindow {
        samples,
        channels: channels as u16,
        sample_rate,
    })
}

fn write_artifact(path: &Path, chunk: &ProcessedChunk) -> io::Result<()> {
    let mut bytes = Vec::with_capacity(ARTIFACT_HEADER_LEN + chunk.samples.len() * 4);
    bytes.extend_from_slice(&chunk.sample_rate.to_le_bytes());
    bytes.extend_from_slice(&chunk.channels.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 2]);
    for sample in chunk.samples.iter() {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    fs::write(path, bytes)
}

fn read_artifact(path: &Path) -> io::Result<ProcessedChunk> {
    let bytes = fs::read(path)?;
    if bytes.len() < ARTIFACT_HEADER_LEN || (bytes.len() - ARTIFACT_HEADER_LEN) % 4 != 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated artifact"));
    }

    let sample_rate = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let channels = u16::from_le_bytes([bytes[4], bytes[5]]);
    let samples = bytes[ARTIFACT_HEADER_LEN..]
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    Ok(ProcessedChunk::new(samples, channels, sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MockTrackLookup;

    fn processor(dir: &Path, source: Option<std::path::PathBuf>) -> FileChunkProcessor {
        let mut tracks = MockTrackLookup::new();
        tracks.expect_filepath_for().returning(move |_| source.clone());
        FileChunkProcessor::new(Arc::new(tracks), ChunkCacheKeys::new(dir.join("chunks")), 1.0, 44_100)
    }

    #[test]
    fn test_artifact_roundtrip_keeps_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.f32");
        let chunk = ProcessedChunk::new(vec![0.25, -0.5, 1.0, 0.0], 2, 48_000);
        write_artifact(&path, &chunk).unwrap();

        let back = read_artifact(&path).unwrap();
        assert_eq!(back.sample_rate, 48_000);
        assert_eq!(back.channels, 2);
        assert_eq!(&*back.samples, &[0.25, -0.5, 1.0, 0.0]);
        assert_eq!(back.size_bytes, 16);
    }

    #[test]
    fn test_existing_artifact_is_served_without_decoding() {
        let dir = tempfile::tempdir().unwrap();
        // Not decodable: only the artifact path can satisfy the request.
        let source = dir.path().join("track.wav");
        fs::write(&source, b"garbage").unwrap();

        let mut renderer = processor(dir.path(), Some(source.clone()));
        let key = ChunkKey::new(4, Preset::Warm, 2, 0.5);
        assert!(matches!(renderer.process(&key), Err(ProcessingError::Decode(_))));

        let artifact = renderer.keys.artifact_path(&key, &source).unwrap();
        fs::create_dir_all(renderer.keys.cache_dir()).unwrap();
        write_artifact(&artifact, &ProcessedChunk::new(vec![0.1; 6], 2, 44_100)).unwrap();

        let chunk = renderer.process(&key).unwrap();
        assert_eq!(chunk.artifact, Some(artifact));
        assert_eq!(chunk.samples.len(), 6);
    }

    /// 16-bit PCM mono WAV.
    fn write_wav(path: &Path, sample_rate: u32, samples: &[i16]) {
        let data_len = (samples.len() * 2) as u32;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&(sample_rate * 2).to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_later_chunks_decode_their_own_window() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("steps.wav");
        // Three seconds at 8 kHz, a different level each second.
        let samples: Vec<i16> = (0..24_000).map(|i| ((i / 8_000 + 1) * 1_000) as i16).collect();
        write_wav(&source, 8_000, &samples);

        let mut renderer = processor(dir.path(), Some(source));
        for (idx, level) in [(1u32, 2_000.0f32), (2, 3_000.0), (0, 1_000.0)] {
            let chunk = renderer
                .process(&ChunkKey::new(1, Preset::Original, idx, 1.0))
                .unwrap();
            assert_eq!(chunk.sample_rate, 8_000);
            assert_eq!(chunk.samples.len(), 8_000, "chunk {idx}");
            let expected = level / 32_768.0;
            assert!(
                chunk.samples.iter().all(|s| (s - expected).abs() < 1e-4),
                "chunk {idx}"
            );
        }

        let err = renderer
            .process(&ChunkKey::new(1, Preset::Original, 4, 1.0))
            .unwrap_err();
        assert!(matches!(err, ProcessingError::ChunkOutOfRange { chunk_idx: 4, .. }));
    }

    #[test]
    fn test_unknown_track_is_a_processing_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut renderer = processor(dir.path(), None);
        let err = renderer.process(&ChunkKey::new(1, Preset::Bright, 0, 1.0)).unwrap_err();
        assert!(matches!(err, ProcessingError::TrackNotFound(1)));
    }

    #[test]
    fn test_shaping_stays_in_range_and_original_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut renderer = processor(dir.path(), None);

        let loud: Vec<f32> = (0..2_000).map(|i| if i % 2 == 0 { 0.99 } else { -0.99 }).collect();
        let mut punchy = loud.clone();
        renderer.shape(&mut punchy, 2, Preset::Punchy, 1.0);
        assert!(punchy.iter().all(|s| (-1.0..=1.0).contains(s)));
        assert_ne!(punchy, loud);

        let mut original = loud.clone();
        renderer.shape(&mut original, 2, Preset::Original, 1.0);
        assert_eq!(original, loud);
    }
}
