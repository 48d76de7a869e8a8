use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;

static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

pub fn sanitize_path_component(name: &str) -> String {
    let name: String = name.nfc().collect();
    let name = name.trim().replace(['\t', '\n'], "");
    let name = WS_RE.replace_all(&name, " ");
    let name = name.replace(" | ", "｜");

    let name = name.trim_end_matches([' ', '-', '.', ';']);

    let forbidden: &[(char, char)] = &[
        ('<', '＜'),
        ('>', '＞'),
        (':', '꞉'),
        ('"', '＂'),
        ('/', '⧸'),
        ('\\', '＼'),
        ('|', '｜'),
        ('?', '？'),
        ('*', ' '),
    ];

    let mut result = name.to_string();
    for (from, to) in forbidden {
        result = result.replace(*from, &to.to_string());
    }

    result.trim().to_string()
}

/// `<output_dir>/<artist> - <title>.<format>`, each part sanitized. An empty
/// artist leaves just the title.
pub fn default_destination(output_dir: &Path, artist: &str, title: &str, format: &str) -> PathBuf {
    let artist = sanitize_path_component(artist);
    let mut title = sanitize_path_component(title);
    if title.is_empty() {
        title = "untitled".to_string();
    }
    let stem = if artist.is_empty() {
        title
    } else {
        format!("{} - {}", artist, title)
    };
    let ext = sanitize_path_component(format.trim_start_matches('.'));
    let file = if ext.is_empty() {
        stem
    } else {
        format!("{}.{}", stem, ext.to_lowercase())
    };
    output_dir.join(file)
}
