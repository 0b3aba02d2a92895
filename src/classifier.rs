use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::Platform;

static YOUTUBE_PLAYLIST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[?&]list=([a-zA-Z0-9_-]+)").expect("valid playlist regex"));

static YOUTUBE_VIDEO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:https?://)?(?:www\.|m\.|music\.)?(?:youtube\.com|youtu\.be)/(?:watch\?v=|embed/|v/|shorts/)?([a-zA-Z0-9_-]{11})",
    )
    .expect("valid video regex")
});

static SOUNDCLOUD: Lazy<[Regex; 3]> = Lazy::new(|| {
    [
        Regex::new(r"^(?:https?://)?(?:www\.)?soundcloud\.com/([a-zA-Z0-9_-]+)/([a-zA-Z0-9_-]+)(?:[/?].*)?$"),
        Regex::new(r"^(?:https?://)?on\.soundcloud\.com/[a-zA-Z0-9]+(?:\?.*)?$"),
        Regex::new(r"^(?:https?://)?m\.soundcloud\.com/([a-zA-Z0-9_-]+)/([a-zA-Z0-9_-]+)(?:[/?].*)?$"),
    ]
    .map(|pattern| pattern.expect("valid soundcloud regex"))
});

/// What a user typed after `play`/`playlist`, normalised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub is_url: bool,
    pub url: Option<String>,
    pub is_playlist: bool,
    pub playlist_id: Option<String>,
    pub track_id: Option<String>,
    pub platform: Platform,
}

impl Classification {
    fn search() -> Self {
        Self {
            is_url: false,
            url: None,
            is_playlist: false,
            playlist_id: None,
            track_id: None,
            platform: Platform::YouTube,
        }
    }
}

/// Classifies user input. Anything that is not a recognised link is a YouTube search.
pub fn classify(input: &str) -> Classification {
    let input = input.trim();

    classify_soundcloud(input)
        .or_else(|| classify_youtube(input))
        .unwrap_or_else(Classification::search)
}

fn classify_soundcloud(input: &str) -> Option<Classification> {
    if !SOUNDCLOUD.iter().any(|pattern| pattern.is_match(input)) {
        return None;
    }

    let url = if input.starts_with("http://") || input.starts_with("https://") {
        input.to_string()
    } else {
        format!("https://{input}")
    };

    Some(Classification {
        is_url: true,
        is_playlist: url.contains("/sets/"),
        url: Some(url),
        playlist_id: None,
        track_id: None,
        platform: Platform::SoundCloud,
    })
}

fn classify_youtube(input: &str) -> Option<Classification> {
    let playlist_id = YOUTUBE_PLAYLIST
        .captures(input)
        .map(|captures| captures[1].to_string());

    if let Some(captures) = YOUTUBE_VIDEO.captures(input) {
        let video_id = captures[1].to_string();

        let url = match &playlist_id {
            Some(list) => format!("https://www.youtube.com/watch?v={video_id}&list={list}"),
            None => format!("https://www.youtube.com/watch?v={video_id}"),
        };

        return Some(Classification {
            is_url: true,
            url: Some(url),
            is_playlist: playlist_id.is_some(),
            playlist_id,
            track_id: Some(video_id),
            platform: Platform::YouTube,
        });
    }

    playlist_id.map(|list| Classification {
        is_url: true,
        url: Some(format!("https://www.youtube.com/playlist?list={list}")),
        is_playlist: true,
        playlist_id: Some(list),
        track_id: None,
        platform: Platform::YouTube,
    })
}
