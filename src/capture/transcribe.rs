//! Whisper-compatible transcription over HTTP.

use reqwest::blocking::multipart;
use serde::Deserialize;
use tracing::debug;

use super::{CaptureError, Transcript};
use crate::config::ConfigHandle;

pub const SAMPLE_RATE: u32 = 16_000;

/// Encode f32 audio samples as 16-bit PCM WAV bytes (mono).
pub fn encode_wav(audio: &[f32], sample_rate: u32) -> Vec<u8> {
    let num_samples = audio.len() as u32;
    let bytes_per_sample: u16 = 2;
    let num_channels: u16 = 1;
    let data_size = num_samples * bytes_per_sample as u32;
    let file_size = 36 + data_size;

    let mut buf = Vec::with_capacity(44 + data_size as usize);

    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&file_size.to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&num_channels.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    let byte_rate = sample_rate * num_channels as u32 * bytes_per_sample as u32;
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    let block_align = num_channels * bytes_per_sample;
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&(bytes_per_sample * 8).to_le_bytes());

    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_size.to_le_bytes());
    for &sample in audio {
        let pcm = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        buf.extend_from_slice(&pcm.to_le_bytes());
    }

    buf
}

/// `en-IN` -> `en`. Whisper wants ISO-639-1.
pub fn whisper_language(tag: &str) -> &str {
    tag.split(['-', '_']).next().unwrap_or(tag)
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    segments: Vec<Segment>,
}

#[derive(Debug, Deserialize)]
struct Segment {
    avg_logprob: Option<f64>,
}

impl TranscriptionResponse {
    /// Mean segment probability, when the server reports log-probs.
    fn confidence(&self) -> Option<f32> {
        let logprobs: Vec<f64> = self.segments.iter().filter_map(|s| s.avg_logprob).collect();
        if logprobs.is_empty() {
            return None;
        }
        let mean = logprobs.iter().sum::<f64>() / logprobs.len() as f64;
        Some(mean.exp().clamp(0.0, 1.0) as f32)
    }
}

/// Sends recorded speech to `<endpoint>/audio/transcriptions`.
pub struct WhisperTranscriber {
    config: ConfigHandle,
    client: reqwest::blocking::Client,
}

impl WhisperTranscriber {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            config,
            client: reqwest::blocking::Client::new(),
        }
    }

    pub fn transcribe(&self, audio: &[f32]) -> Result<Vec<Transcript>, CaptureError> {
        let config = self.config.snapshot();
        let wav = encode_wav(audio, SAMPLE_RATE);
        let url = format!(
            "{}/audio/transcriptions",
            config.stt.endpoint.trim_end_matches('/')
        );
        debug!(bytes = wav.len(), url = %url, "Sending audio for transcription");

        let file_part = multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| CaptureError::Transcription(e.to_string()))?;
        let form = multipart::Form::new()
            .text("model", config.stt.model.clone())
            .text("language", whisper_language(&config.capture.language).to_string())
            .text("response_format", "verbose_json")
            .part("file", file_part);

        let mut request = self.client.post(&url).multipart(form);
        if let Some(key) = config.stt.resolve_api_key() {
            request = request.bearer_auth(key);
        }

        let resp = request
            .send()
            .map_err(|e| CaptureError::Transcription(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(CaptureError::Transcription(format!(
                "STT API error {}: {}",
                status, body
            )));
        }

        let parsed: TranscriptionResponse = resp
            .json()
            .map_err(|e| CaptureError::Transcription(e.to_string()))?;
        let text = parsed.text.trim();
        if text.is_empty() {
            return Err(CaptureError::Unintelligible);
        }
        Ok(vec![Transcript {
            text: text.to_string(),
            confidence: parsed.confidence(),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_wav_header() {
        let wav = encode_wav(&[0.0, 1.0, -1.0, 2.0], SAMPLE_RATE);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 8);
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 16_000);
        // clamped to full scale
        assert_eq!(i16::from_le_bytes([wav[46], wav[47]]), 32767);
        assert_eq!(i16::from_le_bytes([wav[50], wav[51]]), 32767);
    }

    #[test]
    fn test_whisper_language() {
        assert_eq!(whisper_language("en-IN"), "en");
        assert_eq!(whisper_language("hi_IN"), "hi");
        assert_eq!(whisper_language("fr"), "fr");
    }

    #[test]
    fn test_confidence_from_segments() {
        let parsed: TranscriptionResponse = serde_json::from_str(
            r#"{"text":"hello","segments":[{"avg_logprob":-0.1},{"avg_logprob":-0.3}]}"#,
        )
        .unwrap();
        let confidence = parsed.confidence().unwrap();
        assert!((confidence - (-0.2f64).exp() as f32).abs() < 1e-4);

        let plain: TranscriptionResponse = serde_json::from_str(r#"{"text":"hello"}"#).unwrap();
        assert_eq!(plain.confidence(), None);
    }
}
