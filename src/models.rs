use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    YouTube,
    SoundCloud,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::YouTube => write!(f, "YouTube"),
            Platform::SoundCloud => write!(f, "SoundCloud"),
        }
    }
}

/// A playable item as handed to a guild queue. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub title: String,
    /// Page URL on the source platform, also used as the track's identity.
    pub url: String,
    /// Length in seconds, `0` when the platform did not report one.
    pub duration: u64,
    pub thumbnail: Option<String>,
    pub requested_by: String,
    pub platform: Platform,
}

impl Track {
    pub fn formatted_duration(&self) -> String {
        if self.duration == 0 {
            return "live/unknown".to_string();
        }

        let hours = self.duration / 3600;
        let minutes = (self.duration % 3600) / 60;
        let seconds = self.duration % 60;

        if hours > 0 {
            format!("{hours}:{minutes:0>2}:{seconds:0>2}")
        } else {
            format!("{minutes}:{seconds:0>2}")
        }
    }
}

/// Metadata for a single item, before it is attributed to a requester.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackInfo {
    pub title: String,
    pub url: String,
    pub duration: u64,
    pub thumbnail: Option<String>,
}

impl TrackInfo {
    pub fn into_track(self, requested_by: &str, platform: Platform) -> Track {
        Track {
            title: self.title,
            url: self.url,
            duration: self.duration,
            thumbnail: self.thumbnail,
            requested_by: requested_by.to_string(),
            platform,
        }
    }
}
