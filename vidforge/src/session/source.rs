//! Source descriptors and link classification.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::utils::filename::display_stem;
use crate::{Error, Result};

/// Hosts whose pages need the extraction tool rather than a plain GET.
const EXTRACTOR_DOMAINS: &[&str] = &[
    "youtube.com",
    "youtu.be",
    "twitter.com",
    "x.com",
    "instagram.com",
    "tiktok.com",
    "facebook.com",
    "fb.watch",
    "twitch.tv",
    "vimeo.com",
    "dailymotion.com",
    "reddit.com",
    "streamable.com",
    "bilibili.com",
    "nicovideo.jp",
    "rumble.com",
    "odysee.com",
    "ok.ru",
];

/// File lockers and debrid services that cannot be fetched directly.
const BLOCKED_DOMAINS: &[&str] = &[
    "seedr.cc",
    "alldebrid.com",
    "real-debrid.com",
    "debrid-link.fr",
    "premiumize.me",
    "1fichier.com",
    "uptobox.com",
    "mega.nz",
    "mediafire.com",
    "rapidgator.net",
    "nitroflare.com",
];

/// Where a job's video comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Source {
    /// File sent through the transport; `file_ref` is the transport's handle.
    Upload {
        file_ref: String,
        name: String,
        size: u64,
    },
    Url {
        address: String,
    },
    StreamManifest {
        address: String,
    },
    /// Magnet URI or `.torrent` file path/URL.
    Magnet {
        address: String,
    },
}

impl Source {
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Upload { .. } => "upload",
            Self::Url { .. } => "direct link",
            Self::StreamManifest { .. } => "stream link",
            Self::Magnet { .. } => "torrent",
        }
    }

    /// Name the user would recognise, used for job descriptions and artifacts.
    pub fn display_name(&self) -> String {
        match self {
            Self::Upload { name, .. } => name.clone(),
            Self::Url { address } | Self::StreamManifest { address } => Url::parse(address)
                .ok()
                .and_then(|u| {
                    u.path_segments()
                        .and_then(|mut s| s.next_back().map(str::to_string))
                        .filter(|s| !s.is_empty())
                        .or_else(|| u.host_str().map(str::to_string))
                })
                .unwrap_or_else(|| address.clone()),
            Self::Magnet { address } => magnet_display_name(address)
                .unwrap_or_else(|| display_stem(address)),
        }
    }

    pub fn is_stream_manifest(&self) -> bool {
        matches!(self, Self::StreamManifest { .. })
    }
}

/// `dn=` parameter of a magnet URI.
fn magnet_display_name(address: &str) -> Option<String> {
    let query = address.strip_prefix("magnet:?")?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "dn")
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{domain}"))
}

/// Classify a pasted link into a [`Source`].
///
/// Blocked hosts yield `Blocked`; anything that is not a magnet URI or an
/// http(s) URL yields `UnsupportedFormat`.
pub fn classify_link(text: &str) -> Result<Source> {
    let text = text.trim();
    if text.to_ascii_lowercase().starts_with("magnet:") {
        return Ok(Source::Magnet {
            address: text.to_string(),
        });
    }

    let url = Url::parse(text).map_err(|_| Error::unsupported("not a link"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::unsupported(format!("{} links", url.scheme())));
    }
    let host = url
        .host_str()
        .map(|h| h.trim_start_matches("www.").to_ascii_lowercase())
        .ok_or_else(|| Error::unsupported("link without host"))?;
    let path = url.path().to_ascii_lowercase();
    let address = text.to_string();

    if let Some(blocked) = BLOCKED_DOMAINS.iter().find(|d| host_matches(&host, d)) {
        return Err(Error::Blocked((*blocked).to_string()));
    }
    if path.ends_with(".torrent") {
        return Ok(Source::Magnet { address });
    }
    if path.ends_with(".m3u8") || EXTRACTOR_DOMAINS.iter().any(|d| host_matches(&host, d)) {
        return Ok(Source::StreamManifest { address });
    }
    Ok(Source::Url { address })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magnet() {
        let src = classify_link("magnet:?xt=urn:btih:abc&dn=Big+Buck+Bunny").unwrap();
        assert!(matches!(src, Source::Magnet { .. }));
        assert_eq!(src.display_name(), "Big Buck Bunny");
    }

    #[test]
    fn test_torrent_file_url() {
        let src = classify_link("https://releases.example.org/files/debian.iso.torrent").unwrap();
        assert!(matches!(src, Source::Magnet { .. }));
    }

    #[test]
    fn test_stream_manifests() {
        for link in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ",
            "https://m.facebook.com/watch/?v=1",
            "https://cdn.example.com/live/index.m3u8?token=1",
        ] {
            assert!(
                classify_link(link).unwrap().is_stream_manifest(),
                "{link} should be a stream manifest"
            );
        }
    }

    #[test]
    fn test_lookalike_hosts_are_direct() {
        let src = classify_link("https://notyoutube.com/video.mp4").unwrap();
        assert!(matches!(src, Source::Url { .. }));
        assert_eq!(src.display_name(), "video.mp4");
    }

    #[test]
    fn test_blocked() {
        let err = classify_link("https://www.mediafire.com/file/abc/movie.mkv").unwrap_err();
        assert!(matches!(err, Error::Blocked(host) if host == "mediafire.com"));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(classify_link("hello there"), Err(Error::UnsupportedFormat(_))));
        assert!(matches!(
            classify_link("ftp://example.com/a.mp4"),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_upload_display_name() {
        let src = Source::Upload {
            file_ref: "f1".into(),
            name: "clip.mov".into(),
            size: 10,
        };
        assert_eq!(src.display_name(), "clip.mov");
        assert_eq!(src.kind_label(), "upload");
    }
}
