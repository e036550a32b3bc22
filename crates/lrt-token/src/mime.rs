//! Content types for attachment uploads.

use std::path::Path;

/// Guess a content type from the file extension.
pub fn guess_mime_type(ext: &str) -> &'static str {
    match ext.to_lowercase().as_str() {
        // Text
        "txt" | "log" | "parset" | "cfg" | "sh" | "py" => "text/plain",
        "csv" => "text/csv",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "xml" => "application/xml",
        "json" => "application/json",
        "yaml" | "yml" => "application/yaml",
        // Archives
        "tar" => "application/x-tar",
        "gz" | "tgz" => "application/gzip",
        "zip" => "application/zip",
        // Images
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "fits" => "application/fits",
        _ => "application/octet-stream",
    }
}

/// Content type for uploading `path` as an attachment.
pub fn attachment_content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        // LOFAR parsets are plain text whatever the platform thinks.
        Some("parset") => "text/plain",
        Some(ext) => guess_mime_type(ext),
        None => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parset_is_text() {
        assert_eq!(attachment_content_type(Path::new("/tmp/pref_cal1.parset")), "text/plain");
    }

    #[test]
    fn known_and_unknown_extensions() {
        assert_eq!(attachment_content_type(Path::new("srm.TXT")), "text/plain");
        assert_eq!(attachment_content_type(Path::new("plot.png")), "image/png");
        assert_eq!(attachment_content_type(Path::new("blob.bin")), "application/octet-stream");
        assert_eq!(attachment_content_type(Path::new("Makefile")), "application/octet-stream");
    }
}
