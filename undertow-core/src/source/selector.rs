//! Choosing which file of a multi-file source is the one to stream.

use super::SourceFile;

/// Extensions treated as playable video containers.
const MEDIA_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm", "avi", "mov", "m4v"];

/// Picks the primary media file among a source's files.
pub trait PrimaryFileSelector: Send + Sync {
    /// Returns the index of the chosen file, or `None` if nothing qualifies.
    fn select(&self, candidates: &[SourceFile]) -> Option<usize>;
}

/// Largest file with a video extension; falls back to the largest file.
#[derive(Debug, Clone, Copy, Default)]
pub struct LargestMediaFile;

impl LargestMediaFile {
    fn is_media(path: &str) -> bool {
        std::path::Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                MEDIA_EXTENSIONS
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            })
    }

    fn largest<'a>(files: impl Iterator<Item = (usize, &'a SourceFile)>) -> Option<usize> {
        files
            .filter(|(_, file)| file.length > 0)
            .max_by_key(|(_, file)| file.length)
            .map(|(index, _)| index)
    }
}

impl PrimaryFileSelector for LargestMediaFile {
    fn select(&self, candidates: &[SourceFile]) -> Option<usize> {
        Self::largest(
            candidates
                .iter()
                .enumerate()
                .filter(|(_, file)| Self::is_media(&file.path)),
        )
        .or_else(|| Self::largest(candidates.iter().enumerate()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefers_largest_video() {
        let files = vec![
            SourceFile::new("Sample/sample.mkv", 20),
            SourceFile::new("extras.zip", 5_000),
            SourceFile::new("Movie.2019.1080p.MKV", 4_000),
            SourceFile::new("movie.srt", 3),
        ];
        assert_eq!(LargestMediaFile.select(&files), Some(2));
    }

    #[test]
    fn test_falls_back_to_largest_file() {
        let files = vec![SourceFile::new("a.bin", 10), SourceFile::new("b.bin", 30)];
        assert_eq!(LargestMediaFile.select(&files), Some(1));
    }

    #[test]
    fn test_nothing_to_select() {
        assert_eq!(LargestMediaFile.select(&[]), None);
        assert_eq!(LargestMediaFile.select(&[SourceFile::new("empty.mp4", 0)]), None);
    }
}
