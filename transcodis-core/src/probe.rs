//! Typed `ffprobe -show_streams -show_format -of json` output, and the
//! adapter that drives `ffprobe` through a [`ProcessRunner`] and folds its
//! JSON into a [`ContainerDescription`].

use std::sync::{Arc, Mutex};

use serde::Deserialize;
use transcodis_contracts::{ProcessRunner, RunRequest};

use crate::container::{AudioStream, ContainerDescription, SubtitleStream, VideoStream};
use crate::error::{CoreError, CoreResult};

/// Mirrors the subset of `ffprobe`'s JSON schema this crate cares about.
/// Fields ffprobe may omit (bit_depth tags, disposition flags on older
/// builds) are all optional.
#[derive(Debug, Deserialize)]
pub struct FfprobeDocument {
    pub streams: Vec<FfprobeStream>,
    pub format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
pub struct FfprobeFormat {
    #[serde(default, deserialize_with = "deserialize_str_f64")]
    pub duration: f64,
}

#[derive(Debug, Default, Deserialize)]
pub struct FfprobeDisposition {
    #[serde(default)]
    pub forced: i32,
    #[serde(default)]
    pub comment: i32,
}

#[derive(Debug, Deserialize)]
pub struct FfprobeStream {
    pub index: usize,
    pub codec_type: String,
    pub codec_name: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub channels: u32,
    #[serde(default, deserialize_with = "deserialize_opt_str_u64")]
    pub bit_rate: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_frame_rate")]
    pub avg_frame_rate: f64,
    #[serde(default)]
    pub bits_per_raw_sample: Option<u32>,
    #[serde(default)]
    pub tags: Option<FfprobeTags>,
    #[serde(default)]
    pub disposition: FfprobeDisposition,
}

#[derive(Debug, Default, Deserialize)]
pub struct FfprobeTags {
    pub language: Option<String>,
}

fn deserialize_str_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

fn deserialize_opt_str_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: Option<String> = Deserialize::deserialize(deserializer)?;
    match s {
        Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// ffprobe reports `avg_frame_rate` as `N/D`; this rounds it to the
/// nearest integer frame rate. On any parse failure (malformed string,
/// non-numeric parts, zero denominator) this defaults to 24 rather than
/// rejecting the whole document.
fn deserialize_frame_rate<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Ok(parse_frame_rate(&s).map(|v| v.round()).unwrap_or(24.0))
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    let mut parts = s.splitn(2, '/');
    let num: f64 = parts.next()?.parse().ok()?;
    let den: f64 = parts.next().unwrap_or("1").parse().ok()?;
    if den == 0.0 {
        return None;
    }
    Some(num / den)
}

impl FfprobeDocument {
    /// Folds the raw ffprobe document into the crate's own
    /// [`ContainerDescription`]. Streams with a `codec_type` this crate
    /// doesn't model (data, attachment) are dropped.
    pub fn into_container(self) -> ContainerDescription {
        let mut container = ContainerDescription {
            duration_seconds: self.format.duration,
            ..Default::default()
        };

        for stream in self.streams {
            let language = stream.tags.as_ref().and_then(|t| t.language.clone());
            match stream.codec_type.as_str() {
                "video" => container.video.push(VideoStream {
                    index: stream.index,
                    codec_name: stream.codec_name,
                    width: stream.width,
                    height: stream.height,
                    frame_rate: stream.avg_frame_rate,
                    bit_depth: stream.bits_per_raw_sample,
                }),
                "audio" => container.audio.push(AudioStream {
                    index: stream.index,
                    codec_name: stream.codec_name,
                    language,
                    channel_count: stream.channels,
                    bitrate: stream.bit_rate.unwrap_or(0),
                }),
                "subtitle" => container.subtitle.push(SubtitleStream {
                    index: stream.index,
                    codec_name: stream.codec_name,
                    language,
                    forced: stream.disposition.forced != 0,
                    comment: stream.disposition.comment != 0,
                }),
                _ => {}
            }
        }

        container
    }
}

/// Runs `ffprobe -v error -show_streams -show_format -of json <path>`
/// through the given [`ProcessRunner`] and parses its stdout.
pub async fn probe(runner: &dyn ProcessRunner, path: &str) -> CoreResult<ContainerDescription> {
    let buffer = Arc::new(Mutex::new(String::new()));
    let sink_buffer = Arc::clone(&buffer);

    let request = RunRequest::new(
        "ffprobe",
        vec![
            "-v".to_string(),
            "error".to_string(),
            "-show_streams".to_string(),
            "-show_format".to_string(),
            "-of".to_string(),
            "json".to_string(),
            path.to_string(),
        ],
    )
    .with_stdout_sink(Arc::new(move |line: &str| {
        let mut buf = sink_buffer.lock().expect("ffprobe stdout buffer poisoned");
        buf.push_str(line);
        buf.push('\n');
    }));

    runner
        .run(request)
        .await
        .map_err(|e| CoreError::ProbeParse(e.to_string()))?;

    let output = buffer.lock().expect("ffprobe stdout buffer poisoned").clone();
    let document: FfprobeDocument =
        serde_json::from_str(&output).map_err(|e| CoreError::ProbeParse(e.to_string()))?;

    Ok(document.into_container())
}

#[cfg(test)]
mod tests {
    use super::*;
    use transcodis_contracts::FakeProcessRunner;

    const SAMPLE: &str = r#"{
        "streams": [
            {"index":0,"codec_type":"video","codec_name":"h264","width":1920,"height":1080,"avg_frame_rate":"24000/1001","bits_per_raw_sample":8},
            {"index":1,"codec_type":"audio","codec_name":"aac","channels":6,"bit_rate":"384000","tags":{"language":"eng"}},
            {"index":2,"codec_type":"subtitle","codec_name":"subrip","tags":{"language":"eng"},"disposition":{"forced":0,"comment":0}}
        ],
        "format": {"duration": "3600.5"}
    }"#;

    #[tokio::test]
    async fn probe_parses_ffprobe_json_into_container_description() {
        let runner = FakeProcessRunner::new(0).with_stdout(SAMPLE.lines().map(str::to_string).collect());
        let container = probe(&runner, "input.mkv").await.unwrap();

        assert_eq!(container.video.len(), 1);
        assert_eq!(container.audio.len(), 1);
        assert_eq!(container.subtitle.len(), 1);
        assert!((container.duration_seconds - 3600.5).abs() < f64::EPSILON);
        assert!((container.video[0].frame_rate - 24.0).abs() < f64::EPSILON);
    }

    #[test]
    fn frame_rate_falls_back_to_24_on_bad_input() {
        assert_eq!(parse_frame_rate("24000/1001"), Some(24000.0 / 1001.0));
        assert_eq!(parse_frame_rate("30/0"), None);
        assert_eq!(parse_frame_rate("nonsense"), None);
    }

    #[tokio::test]
    async fn probe_rejects_unparseable_output() {
        let runner = FakeProcessRunner::new(0).with_stdout(vec!["not json".to_string()]);
        let result = probe(&runner, "input.mkv").await;
        assert!(result.is_err());
    }
}
