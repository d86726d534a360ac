//! Pure translation of a selected [`ContainerDescription`] into an
//! `ffmpeg` argument vector. Nothing here touches the filesystem or spawns
//! a process; the worker's encode stage is the only caller, and it is the
//! one that drives the resulting plan through a `ProcessRunner`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::container::{AudioStream, ContainerDescription, SubtitleStream};
use crate::error::{CoreError, CoreResult};

/// The codec name `ffprobe` reports for PGS (image-based) subtitles.
pub const PGS_CODEC_NAME: &str = "hdmv_pgs_subtitle";

/// Inputs to [`build_plan`], gathered by the encode stage before it calls
/// in: the container description has already been through
/// [`ContainerDescription::selected`], and any PGS subtitle has already
/// been OCR'd into a sibling `.srt` file by the time this runs.
#[derive(Debug, Clone)]
pub struct PlanRequest<'a> {
    pub container: &'a ContainerDescription,
    pub source_path: String,
    pub work_dir: String,
    pub target_path: String,
    pub thread_count: u32,
    /// Maps a PGS subtitle stream's `index` to the path of its OCR'd
    /// `.srt` file, which is appended as an extra `-i` input.
    pub pgs_srt_paths: HashMap<usize, String>,
}

/// The plan handed to the subprocess driver: `inputs` is every `-i`
/// argument's value in order (source file first, then one per PGS `.srt`
/// file), `args` is the full argument vector `ffmpeg` should be invoked
/// with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfmpegPlan {
    pub inputs: Vec<String>,
    pub args: Vec<String>,
}

fn channel_layout(channel_count: u32) -> String {
    match channel_count {
        1 => "mono".to_string(),
        2 => "stereo".to_string(),
        6 => "5.1".to_string(),
        8 => "7.1".to_string(),
        n => format!("{n}ch"),
    }
}

/// Whether a codec name identifies a PGS (image-based) subtitle: a
/// case-insensitive substring match on `"pgs"`, not exact equality,
/// since vendor/ffprobe builds report PGS under several literal strings.
pub fn is_pgs_codec(codec_name: &str) -> bool {
    codec_name.to_lowercase().contains("pgs")
}

fn is_pgs(stream: &SubtitleStream) -> bool {
    is_pgs_codec(&stream.codec_name)
}

/// Builds the `ffmpeg` argument vector for a transcode, following the
/// plan invariants: one video map with the fixed scale/pixel-format/CRF
/// settings, one audio output per retained stream, one subtitle output
/// per retained stream (copied through for text formats, re-muxed from
/// the OCR'd `.srt` for PGS), and the container description embedded as
/// JSON metadata.
pub fn build_plan(request: &PlanRequest<'_>) -> CoreResult<FfmpegPlan> {
    let container = request.container;

    let Some(video) = container.video.first() else {
        return Err(CoreError::PlanError("container has no video stream".into()));
    };

    let mut inputs = vec![request.source_path.clone()];
    let mut args = vec![
        "-hide_banner".to_string(),
        "-threads".to_string(),
        request.thread_count.to_string(),
        "-max_muxing_queue_size".to_string(),
        "9999".to_string(),
        "-i".to_string(),
        request.source_path.clone(),
    ];

    // Extra inputs for PGS-derived .srt files, in subtitle-list order.
    let pgs_subtitles: Vec<&SubtitleStream> = container.subtitle.iter().filter(|s| is_pgs(s)).collect();
    for subtitle in &pgs_subtitles {
        let srt_path = request
            .pgs_srt_paths
            .get(&subtitle.index)
            .ok_or_else(|| CoreError::PlanError(format!("missing OCR'd srt for subtitle {}", subtitle.index)))?;
        inputs.push(srt_path.clone());
        args.push("-i".to_string());
        args.push(srt_path.clone());
    }

    args.push("-map".to_string());
    args.push(format!("0:{}", video.index));
    args.push("-map_chapters".to_string());
    args.push("-1".to_string());
    args.push("-flags".to_string());
    args.push("+global_header".to_string());
    args.push("-vf".to_string());
    args.push("scale='min(1920,iw)':-1:force_original_aspect_ratio=decrease".to_string());
    args.push("-pix_fmt".to_string());
    args.push("yuv420p10le".to_string());
    args.push("-c:v".to_string());
    args.push("libx265".to_string());
    args.push("-crf".to_string());
    args.push("28".to_string());
    args.push("-profile:v".to_string());
    args.push("main10".to_string());

    for (output_index, audio) in container.audio.iter().enumerate() {
        append_audio_output(&mut args, audio, output_index);
    }

    let mut extra_input_cursor = 0usize;
    for (output_index, subtitle) in container.subtitle.iter().enumerate() {
        if is_pgs(subtitle) {
            let extra_input = 1 + extra_input_cursor;
            extra_input_cursor += 1;
            args.push("-map".to_string());
            args.push(format!("{extra_input}:0"));
            args.push(format!("-c:s:{output_index}"));
            args.push("srt".to_string());
        } else {
            args.push("-map".to_string());
            args.push(format!("0:{}", subtitle.index));
            args.push(format!("-c:s:{output_index}"));
            args.push("copy".to_string());
        }
        append_subtitle_disposition(&mut args, subtitle, output_index);
    }

    let metadata_json = serde_json::to_string(container)?;
    args.push("-metadata".to_string());
    args.push(format!("encodeParameters={metadata_json}"));

    args.push("-y".to_string());
    args.push(request.target_path.clone());

    Ok(FfmpegPlan { inputs, args })
}

fn append_audio_output(args: &mut Vec<String>, audio: &AudioStream, output_index: usize) {
    let lang = audio.language.as_deref().unwrap_or("und");
    let layout = channel_layout(audio.channel_count);
    args.push("-map".to_string());
    args.push(format!("0:{}", audio.index));
    args.push(format!("-metadata:s:a:{output_index}"));
    args.push(format!("title={lang} ({layout})"));
    args.push(format!("-c:a:{output_index}"));
    args.push("libfdk_aac".to_string());
    args.push("-vbr".to_string());
    args.push("5".to_string());
}

fn append_subtitle_disposition(args: &mut Vec<String>, subtitle: &SubtitleStream, output_index: usize) {
    if subtitle.forced {
        args.push(format!("-disposition:s:s:{output_index}"));
        args.push("forced".to_string());
    } else if subtitle.comment {
        args.push(format!("-disposition:s:s:{output_index}"));
        args.push("comment".to_string());
    } else {
        args.push(format!("-disposition:s:s:{output_index}"));
        args.push("default".to_string());
    }

    if let Some(lang) = &subtitle.language {
        args.push(format!("-metadata:s:s:{output_index}"));
        args.push(format!("language={lang}"));
        args.push(format!("-metadata:s:s:{output_index}"));
        args.push(format!("title={lang}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::VideoStream;

    fn sample_container() -> ContainerDescription {
        ContainerDescription {
            duration_seconds: 600.0,
            video: vec![VideoStream {
                index: 0,
                codec_name: "h264".into(),
                width: 1920,
                height: 1080,
                frame_rate: 23.976,
                bit_depth: Some(8),
            }],
            audio: vec![AudioStream {
                index: 1,
                codec_name: "aac".into(),
                language: Some("eng".into()),
                channel_count: 6,
                bitrate: 384_000,
            }],
            subtitle: vec![SubtitleStream {
                index: 2,
                codec_name: "subrip".into(),
                language: Some("eng".into()),
                forced: false,
                comment: false,
            }],
        }
    }

    fn request(container: &ContainerDescription) -> PlanRequest<'_> {
        PlanRequest {
            container,
            source_path: "/work/job.mkv".into(),
            work_dir: "/work".into(),
            target_path: "/work/job-encoded.mkv".into(),
            thread_count: 4,
            pgs_srt_paths: HashMap::new(),
        }
    }

    #[test]
    fn first_input_is_source_path() {
        let container = sample_container();
        let plan = build_plan(&request(&container)).unwrap();
        assert_eq!(plan.inputs[0], "/work/job.mkv");
    }

    #[test]
    fn extra_input_count_equals_pgs_subtitle_count() {
        let mut container = sample_container();
        container.subtitle.push(SubtitleStream {
            index: 3,
            codec_name: PGS_CODEC_NAME.into(),
            language: Some("jpn".into()),
            forced: false,
            comment: false,
        });

        let mut pgs_srt_paths = HashMap::new();
        pgs_srt_paths.insert(3, "/work/3.srt".to_string());

        let plan_request = PlanRequest {
            pgs_srt_paths,
            ..request(&container)
        };
        let plan = build_plan(&plan_request).unwrap();

        assert_eq!(plan.inputs.len(), 2);
        assert_eq!(plan.inputs[1], "/work/3.srt");
    }

    #[test]
    fn audio_output_count_matches_distinct_languages() {
        let container = sample_container();
        let plan = build_plan(&request(&container)).unwrap();
        let audio_maps = plan.args.windows(2).filter(|w| w[0] == "-map" && w[1] == "0:1").count();
        assert_eq!(audio_maps, 1);
    }

    #[test]
    fn missing_video_stream_is_rejected() {
        let mut container = sample_container();
        container.video.clear();
        let result = build_plan(&request(&container));
        assert!(result.is_err());
    }

    #[test]
    fn pgs_subtitle_without_ocr_path_is_rejected() {
        let mut container = sample_container();
        container.subtitle.push(SubtitleStream {
            index: 3,
            codec_name: PGS_CODEC_NAME.into(),
            language: Some("jpn".into()),
            forced: false,
            comment: false,
        });
        let result = build_plan(&request(&container));
        assert!(result.is_err());
    }
}
