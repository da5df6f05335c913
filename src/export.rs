use crate::error::{Result, ToneLinkError};
use crate::modulation::ToneBurst;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

const PCM_FORMAT: u16 = 1;
const BITS_PER_SAMPLE: u16 = 16;

/// Mixes a whole burst schedule into one mono buffer.
pub fn render_schedule(bursts: &[ToneBurst], sample_rate: u32, volume: f32) -> Vec<f32> {
    let end = bursts
        .iter()
        .map(|b| b.end_time().as_secs_f64())
        .fold(0.0f64, f64::max);
    let mut samples = vec![0.0f32; (end * sample_rate as f64).ceil() as usize];

    for burst in bursts {
        let offset = (burst.start_time.as_secs_f64() * sample_rate as f64).round() as usize;
        burst.render_into(&mut samples, offset, sample_rate, volume);
    }

    samples
}

/// Mono 16-bit PCM.
pub fn write_wav<W: Write>(mut writer: W, samples: &[f32], sample_rate: u32) -> Result<()> {
    let data_len = (samples.len() * 2) as u32;

    writer.write_all(b"RIFF")?;
    writer.write_u32::<LittleEndian>(36 + data_len)?;
    writer.write_all(b"WAVE")?;

    writer.write_all(b"fmt ")?;
    writer.write_u32::<LittleEndian>(16)?;
    writer.write_u16::<LittleEndian>(PCM_FORMAT)?;
    writer.write_u16::<LittleEndian>(1)?;
    writer.write_u32::<LittleEndian>(sample_rate)?;
    writer.write_u32::<LittleEndian>(sample_rate * 2)?;
    writer.write_u16::<LittleEndian>(2)?;
    writer.write_u16::<LittleEndian>(BITS_PER_SAMPLE)?;

    writer.write_all(b"data")?;
    writer.write_u32::<LittleEndian>(data_len)?;
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer.write_i16::<LittleEndian>(value)?;
    }

    writer.flush()?;
    Ok(())
}

/// Reads 16-bit PCM; multichannel input is averaged down to mono.
pub fn read_wav<R: Read>(mut reader: R) -> Result<(Vec<f32>, u32)> {
    let mut tag = [0u8; 4];

    reader.read_exact(&mut tag)?;
    if &tag != b"RIFF" {
        return Err(ToneLinkError::InvalidWav("missing RIFF header".into()));
    }
    reader.read_u32::<LittleEndian>()?;
    reader.read_exact(&mut tag)?;
    if &tag != b"WAVE" {
        return Err(ToneLinkError::InvalidWav("not a WAVE file".into()));
    }

    let mut format: Option<(u16, u32)> = None;

    loop {
        match reader.read_exact(&mut tag) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(ToneLinkError::InvalidWav("no data chunk".into()));
            }
            Err(e) => return Err(e.into()),
        }
        let size = reader.read_u32::<LittleEndian>()?;

        match &tag {
            b"fmt " => {
                if size < 16 {
                    return Err(ToneLinkError::InvalidWav("fmt chunk too short".into()));
                }
                let audio_format = reader.read_u16::<LittleEndian>()?;
                let channels = reader.read_u16::<LittleEndian>()?;
                let sample_rate = reader.read_u32::<LittleEndian>()?;
                reader.read_u32::<LittleEndian>()?;
                reader.read_u16::<LittleEndian>()?;
                let bits = reader.read_u16::<LittleEndian>()?;
                skip(&mut reader, (size - 16) as u64 + (size & 1) as u64)?;

                if audio_format != PCM_FORMAT || bits != BITS_PER_SAMPLE {
                    return Err(ToneLinkError::InvalidWav(format!(
                        "unsupported encoding (format {}, {} bits)",
                        audio_format, bits
                    )));
                }
                if channels == 0 || sample_rate == 0 {
                    return Err(ToneLinkError::InvalidWav("empty fmt chunk".into()));
                }
                format = Some((channels, sample_rate));
            }
            b"data" => {
                let (channels, sample_rate) = format.ok_or_else(|| {
                    ToneLinkError::InvalidWav("data chunk before fmt chunk".into())
                })?;

                let mut bytes = Vec::new();
                reader.by_ref().take(size as u64).read_to_end(&mut bytes)?;

                let frame = channels as usize * 2;
                let mut samples = Vec::with_capacity(bytes.len() / frame);
                for chunk in bytes.chunks_exact(frame) {
                    let mut cursor = chunk;
                    let mut sum = 0.0f32;
                    for _ in 0..channels {
                        sum += cursor.read_i16::<LittleEndian>()? as f32 / i16::MAX as f32;
                    }
                    samples.push(sum / channels as f32);
                }

                debug!(
                    "Read {} samples at {} Hz ({} channels)",
                    samples.len(),
                    sample_rate,
                    channels
                );
                return Ok((samples, sample_rate));
            }
            _ => skip(&mut reader, size as u64 + (size & 1) as u64)?,
        }
    }
}

pub fn save_wav<P: AsRef<Path>>(path: P, samples: &[f32], sample_rate: u32) -> Result<()> {
    let file = File::create(path)?;
    write_wav(BufWriter::new(file), samples, sample_rate)
}

pub fn load_wav<P: AsRef<Path>>(path: P) -> Result<(Vec<f32>, u32)> {
    let file = File::open(path)?;
    read_wav(BufReader::new(file))
}

fn skip<R: Read>(reader: &mut R, len: u64) -> Result<()> {
    io::copy(&mut reader.take(len), &mut io::sink())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use crate::modulation::{Modulator, ModulatorConfig};
    use std::sync::Arc;

    #[test]
    fn test_render_schedule_length() {
        let modulator = Modulator::new(Arc::new(Codec::default()), ModulatorConfig::default());
        let bursts = modulator.schedule("ab", true);
        let samples = render_schedule(&bursts, 48000, 0.5);

        // ^ a . b $
        assert_eq!(samples.len(), 5 * 7200);
        assert!(samples.iter().all(|s| s.abs() <= 0.5 + 1e-6));
    }

    #[test]
    fn test_skipped_slot_is_silent() {
        let modulator = Modulator::new(Arc::new(Codec::default()), ModulatorConfig::default());
        let bursts = modulator.schedule("a(b", false);
        let samples = render_schedule(&bursts, 48000, 0.5);

        assert_eq!(samples.len(), 5 * 7200);
        assert!(samples[2 * 7200..3 * 7200].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_wav_header_layout() {
        let mut bytes = Vec::new();
        write_wav(&mut bytes, &[0.0, 1.0, -1.0], 44100).unwrap();

        assert_eq!(bytes.len(), 44 + 6);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(&bytes[36..40], b"data");
        assert_eq!(&bytes[44..46], &0i16.to_le_bytes());
        assert_eq!(&bytes[46..48], &i16::MAX.to_le_bytes());
        assert_eq!(&bytes[48..50], &(-i16::MAX).to_le_bytes());
    }

    #[test]
    fn test_wav_read_back() {
        let samples = vec![0.0, 0.25, -0.5, 0.75];
        let mut bytes = Vec::new();
        write_wav(&mut bytes, &samples, 48000).unwrap();

        let (decoded, sample_rate) = read_wav(bytes.as_slice()).unwrap();
        assert_eq!(sample_rate, 48000);
        assert_eq!(decoded.len(), samples.len());
        for (a, b) in decoded.iter().zip(&samples) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn test_stereo_is_averaged() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.write_u32::<LittleEndian>(36 + 8).unwrap();
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.write_u32::<LittleEndian>(16).unwrap();
        bytes.write_u16::<LittleEndian>(1).unwrap();
        bytes.write_u16::<LittleEndian>(2).unwrap();
        bytes.write_u32::<LittleEndian>(8000).unwrap();
        bytes.write_u32::<LittleEndian>(32000).unwrap();
        bytes.write_u16::<LittleEndian>(4).unwrap();
        bytes.write_u16::<LittleEndian>(16).unwrap();
        bytes.extend_from_slice(b"LIST");
        bytes.write_u32::<LittleEndian>(3).unwrap();
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        bytes.extend_from_slice(b"data");
        bytes.write_u32::<LittleEndian>(8).unwrap();
        for v in [i16::MAX, 0, 0, -i16::MAX] {
            bytes.write_i16::<LittleEndian>(v).unwrap();
        }

        let (samples, sample_rate) = read_wav(bytes.as_slice()).unwrap();
        assert_eq!(sample_rate, 8000);
        assert_eq!(samples, vec![0.5, -0.5]);
    }

    #[test]
    fn test_rejects_non_wav() {
        assert!(matches!(
            read_wav(&b"RIFX\0\0\0\0WAVE"[..]),
            Err(ToneLinkError::InvalidWav(_))
        ));
        let mut bytes = Vec::new();
        write_wav(&mut bytes, &[], 48000).unwrap();
        bytes.truncate(36);
        assert!(matches!(
            read_wav(bytes.as_slice()),
            Err(ToneLinkError::InvalidWav(_))
        ));
    }
}
