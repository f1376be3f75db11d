//! WAV playback via rodio for the fallback renderer.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rodio::{Decoder, OutputStream, Sink};

use super::engine::SpeechError;

/// Play a WAV file through the default output device, blocking until done.
pub fn play_wav_file(path: &Path, volume: f32) -> Result<(), SpeechError> {
    let (_stream, stream_handle) = OutputStream::try_default()
        .map_err(|e| SpeechError::Playback(format!("Failed to open audio output: {}", e)))?;
    let sink = Sink::try_new(&stream_handle)
        .map_err(|e| SpeechError::Playback(format!("Failed to create audio sink: {}", e)))?;

    let file = File::open(path)?;
    let source = Decoder::new(BufReader::new(file))
        .map_err(|e| SpeechError::Playback(format!("Failed to decode {}: {}", path.display(), e)))?;

    sink.set_volume(volume.clamp(0.0, 1.0));
    sink.append(source);
    sink.sleep_until_end();
    Ok(())
}
