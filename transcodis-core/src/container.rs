//! The probed container description and the stream selection policy that
//! turns it into the handful of streams the FFMPEG plan will keep.

use serde::{Deserialize, Serialize};

/// A parsed, codec-agnostic view of a source file's streams, built from
/// an `ffprobe` run (see [`crate::probe`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerDescription {
    pub duration_seconds: f64,
    pub video: Vec<VideoStream>,
    pub audio: Vec<AudioStream>,
    pub subtitle: Vec<SubtitleStream>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoStream {
    pub index: usize,
    pub codec_name: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub bit_depth: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioStream {
    pub index: usize,
    pub codec_name: String,
    pub language: Option<String>,
    pub channel_count: u32,
    pub bitrate: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleStream {
    pub index: usize,
    pub codec_name: String,
    pub language: Option<String>,
    pub forced: bool,
    pub comment: bool,
}

/// Group audio streams by language and keep, per language, the stream
/// with the maximum `(channel_count, bitrate)` pair — compared
/// lexicographically, channel count first. Streams with no language tag
/// are each kept as their own singleton group, since there is nothing to
/// deduplicate them against.
pub fn select_audio(streams: &[AudioStream]) -> Vec<AudioStream> {
    let mut by_language: Vec<(Option<String>, AudioStream)> = Vec::new();

    for stream in streams {
        match stream.language.as_ref() {
            None => by_language.push((None, stream.clone())),
            Some(lang) => {
                let existing = by_language
                    .iter_mut()
                    .find(|(l, _)| l.as_deref() == Some(lang.as_str()));
                match existing {
                    Some((_, winner)) => {
                        if (stream.channel_count, stream.bitrate)
                            > (winner.channel_count, winner.bitrate)
                        {
                            *winner = stream.clone();
                        }
                    }
                    None => by_language.push((Some(lang.clone()), stream.clone())),
                }
            }
        }
    }

    by_language.into_iter().map(|(_, stream)| stream).collect()
}

/// Single-inclusion subtitle selection: a `forced` or `comment` stream is
/// always kept regardless of language, since it is never a duplicate of
/// the plain subtitle track for that language. Plain subtitle tracks are
/// deduplicated per language, first-seen wins — a winner is never listed
/// twice even if a later stream in the same language is itself forced or
/// a comment track (that later stream is still kept, just as its own
/// entry, not as a second copy of the plain winner).
pub fn select_subtitles(streams: &[SubtitleStream]) -> Vec<SubtitleStream> {
    let mut kept: Vec<SubtitleStream> = Vec::new();
    let mut seen_plain_language: Vec<String> = Vec::new();

    for stream in streams {
        if stream.forced || stream.comment {
            kept.push(stream.clone());
            continue;
        }

        match stream.language.as_ref() {
            None => kept.push(stream.clone()),
            Some(lang) => {
                if !seen_plain_language.iter().any(|l| l == lang) {
                    seen_plain_language.push(lang.clone());
                    kept.push(stream.clone());
                }
            }
        }
    }

    kept
}

impl ContainerDescription {
    /// Applies [`select_audio`] and [`select_subtitles`] in place, leaving
    /// video streams untouched (the planner always keeps every video
    /// stream it is given).
    pub fn selected(&self) -> ContainerDescription {
        ContainerDescription {
            duration_seconds: self.duration_seconds,
            video: self.video.clone(),
            audio: select_audio(&self.audio),
            subtitle: select_subtitles(&self.subtitle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(index: usize, language: &str, channel_count: u32, bitrate: u64) -> AudioStream {
        AudioStream {
            index,
            codec_name: "aac".into(),
            language: Some(language.into()),
            channel_count,
            bitrate,
        }
    }

    fn subtitle(index: usize, language: &str, forced: bool, comment: bool) -> SubtitleStream {
        SubtitleStream {
            index,
            codec_name: "subrip".into(),
            language: Some(language.into()),
            forced,
            comment,
        }
    }

    #[test]
    fn audio_selection_prefers_max_channel_count_then_bitrate() {
        let streams = vec![
            audio(0, "eng", 2, 192_000),
            audio(1, "eng", 6, 96_000),
            audio(2, "eng", 6, 384_000),
            audio(3, "jpn", 2, 128_000),
        ];

        let selected = select_audio(&streams);
        assert_eq!(selected.len(), 2);
        let eng = selected.iter().find(|s| s.language.as_deref() == Some("eng")).unwrap();
        assert_eq!(eng.index, 2);
        let jpn = selected.iter().find(|s| s.language.as_deref() == Some("jpn")).unwrap();
        assert_eq!(jpn.index, 3);
    }

    #[test]
    fn untagged_audio_streams_are_each_kept() {
        let streams = vec![
            AudioStream { index: 0, codec_name: "aac".into(), language: None, channel_count: 2, bitrate: 128_000 },
            AudioStream { index: 1, codec_name: "aac".into(), language: None, channel_count: 6, bitrate: 384_000 },
        ];
        assert_eq!(select_audio(&streams).len(), 2);
    }

    #[test]
    fn subtitle_forced_and_comment_tracks_are_never_deduplicated_away() {
        let streams = vec![
            subtitle(0, "eng", false, false),
            subtitle(1, "eng", true, false),
            subtitle(2, "eng", false, true),
            subtitle(3, "eng", false, false),
        ];

        let selected = select_subtitles(&streams);
        let indices: Vec<usize> = selected.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn subtitle_plain_tracks_dedup_first_seen_per_language() {
        let streams = vec![
            subtitle(0, "eng", false, false),
            subtitle(1, "fra", false, false),
            subtitle(2, "eng", false, false),
        ];
        let selected = select_subtitles(&streams);
        let indices: Vec<usize> = selected.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1]);
    }
}
