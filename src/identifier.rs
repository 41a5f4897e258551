//! Pure URL parsing for YouTube video and playlist identifiers.
//!
//! Nothing in here performs I/O or fails loudly: anything we do not recognize
//! is simply `None`.

const VIDEO_ID_LEN: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Host {
    /// `youtube.com` and its mobile/music/nocookie variants.
    Main,
    /// `youtu.be` short links.
    Short,
}

#[derive(Debug)]
struct ParsedUrl<'a> {
    host: Host,
    path: &'a str,
    query: &'a str,
}

impl<'a> ParsedUrl<'a> {
    fn parse(url: &'a str) -> Option<Self> {
        let trimmed = url.trim();
        if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
            return None;
        }
        let rest = strip_scheme(trimmed);
        let rest = rest.split('#').next().unwrap_or(rest);
        let (authority, tail) = match rest.find(['/', '?']) {
            Some(index) => rest.split_at(index),
            None => (rest, ""),
        };
        let (path, query) = tail.split_once('?').unwrap_or((tail, ""));
        let host_name = authority.rsplit('@').next()?.split(':').next()?;
        let host = classify_host(&host_name.to_ascii_lowercase())?;
        Some(Self { host, path, query })
    }

    fn query_param(&self, name: &str) -> Option<&'a str> {
        self.query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
            .filter(|value| !value.is_empty())
    }

    fn segments(&self) -> impl Iterator<Item = &'a str> {
        self.path.split('/').filter(|segment| !segment.is_empty())
    }
}

fn strip_scheme(url: &str) -> &str {
    for scheme in ["https://", "http://", "//"] {
        if url
            .get(..scheme.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
        {
            return &url[scheme.len()..];
        }
    }
    url
}

fn classify_host(host: &str) -> Option<Host> {
    let bare = ["www.", "m.", "music."]
        .iter()
        .find_map(|prefix| host.strip_prefix(prefix))
        .unwrap_or(host);
    match bare {
        "youtube.com" | "youtube-nocookie.com" => Some(Host::Main),
        "youtu.be" => Some(Host::Short),
        _ => None,
    }
}

/// True for the 11 character `[A-Za-z0-9_-]` ids YouTube hands out.
pub fn is_valid_video_id(candidate: &str) -> bool {
    candidate.len() == VIDEO_ID_LEN && candidate.bytes().all(is_id_byte)
}

fn is_valid_playlist_id(candidate: &str) -> bool {
    !candidate.is_empty() && candidate.bytes().all(is_id_byte)
}

fn is_id_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_'
}

/// Extracts the video id from `watch?v=`, `/shorts/`, `/embed/`, `/live/` and
/// `youtu.be/` links.
pub fn extract_video_id(url: &str) -> Option<String> {
    let parsed = ParsedUrl::parse(url)?;
    let mut segments = parsed.segments();
    let candidate = match parsed.host {
        Host::Short => segments.next()?,
        Host::Main => match segments.next()? {
            "watch" => parsed.query_param("v")?,
            "shorts" | "embed" | "live" | "v" => segments.next()?,
            _ => return None,
        },
    };
    is_valid_video_id(candidate).then(|| candidate.to_string())
}

/// Extracts the playlist id from `/playlist?list=` links and from the `list=`
/// parameter videos carry when opened from a playlist.
pub fn extract_playlist_id(url: &str) -> Option<String> {
    let parsed = ParsedUrl::parse(url)?;
    let accepts_list = match parsed.host {
        Host::Short => true,
        Host::Main => matches!(parsed.segments().next(), Some("playlist" | "watch")),
    };
    if !accepts_list {
        return None;
    }
    let candidate = parsed.query_param("list")?;
    is_valid_playlist_id(candidate).then(|| candidate.to_string())
}

pub fn canonical_video_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

pub fn canonical_playlist_url(playlist_id: &str) -> String {
    format!("https://www.youtube.com/playlist?list={playlist_id}")
}
