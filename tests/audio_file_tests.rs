// Integration tests for audio file processing
//
// These tests verify that we can read WAV files, split them into capture
// frames and write playback back out.

use anyhow::Result;
use loqa_voice::audio::{wav_bytes, AudioFile, AudioFrame, AudioSink, WavFileSink};
use std::path::PathBuf;

fn write_fixture(dir: &tempfile::TempDir, name: &str, samples: &[i16], rate: u32, channels: u16) -> Result<PathBuf> {
    let path = dir.path().join(name);
    std::fs::write(&path, wav_bytes(samples, rate, channels)?)?;
    Ok(path)
}

#[test]
fn test_audio_file_open() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let samples: Vec<i16> = (0..24000).map(|i| ((i * 7) % 2000) as i16).collect();
    let path = write_fixture(&dir, "one-second.wav", &samples, 24000, 1)?;

    let audio = AudioFile::open(&path)?;

    assert!((audio.duration_seconds - 1.0).abs() < 1e-9);
    assert_eq!(audio.sample_rate, 24000);
    assert_eq!(audio.channels, 1);
    assert_eq!(audio.samples, samples);
    assert!(audio.path.contains("one-second.wav"));

    Ok(())
}

#[test]
fn test_audio_file_stereo_duration() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let samples = vec![0i16; 48000 * 2 / 2];
    let path = write_fixture(&dir, "stereo.wav", &samples, 48000, 2)?;

    let audio = AudioFile::open(&path)?;
    assert_eq!(audio.channels, 2);
    assert!((audio.duration_seconds - 0.5).abs() < 1e-9);

    Ok(())
}

#[test]
fn test_audio_file_nonexistent() {
    let path = PathBuf::from("/nonexistent/path/to/audio.wav");
    let result = AudioFile::open(&path);

    assert!(result.is_err(), "Opening nonexistent file should fail");
}

#[test]
fn test_audio_file_rejects_float_samples() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("float.wav");
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 24000,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(&path, spec)?;
    writer.write_sample(0.5f32)?;
    writer.finalize()?;

    assert!(AudioFile::open(&path).is_err());
    Ok(())
}

#[test]
fn test_frames_split_and_flag_last() -> Result<()> {
    let dir = tempfile::tempdir()?;
    // 2.5 frames of 100ms
    let samples: Vec<i16> = (0..6000).map(|i| i as i16).collect();
    let path = write_fixture(&dir, "turn.wav", &samples, 24000, 1)?;

    let frames = AudioFile::open(&path)?.frames(100);

    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].samples.len(), 2400);
    assert_eq!(frames[2].samples.len(), 1200);
    assert_eq!(frames[1].timestamp_ms, 100);
    assert_eq!(
        frames.iter().map(|f| f.is_final).collect::<Vec<_>>(),
        vec![false, false, true]
    );

    Ok(())
}

#[test]
fn test_empty_file_still_ends_turn() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_fixture(&dir, "empty.wav", &[], 24000, 1)?;

    let frames = AudioFile::open(&path)?.frames(100);
    assert_eq!(frames.len(), 1);
    assert!(frames[0].is_final);
    assert!(frames[0].samples.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_wav_file_sink_records_playback() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("reply.wav");

    let mut sink = WavFileSink::new(&path);
    sink.play(&AudioFrame::new(vec![1, 2, 3], 24000, 1)).await?;
    sink.play(&AudioFrame::new(vec![4, 5], 24000, 1)).await?;
    // Format mismatch is skipped
    sink.play(&AudioFrame::new(vec![9; 4], 16000, 1)).await?;
    assert_eq!(sink.sample_count(), 5);
    assert_eq!(sink.finish()?, 5);

    let audio = AudioFile::open(&path)?;
    assert_eq!(audio.samples, vec![1, 2, 3, 4, 5]);
    assert_eq!(audio.sample_rate, 24000);

    Ok(())
}
