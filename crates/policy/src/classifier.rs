use std::path::Path;
use vigil_interfaces::PriorityTier;

// Extension tables, checked case-insensitively. Unknown extensions (and
// extensionless paths) fall through to `Normal`.
const IMMEDIATE: &[&str] = &[
    "exe", "dll", "scr", "com", "bat", "cmd", "pif", "msi", "sys", "drv", "cpl",
];
const HIGH: &[&str] = &[
    "sh", "bash", "ps1", "vbs", "vbe", "js", "jse", "wsf", "hta", "jar", "py", "pl", "rb", "so",
    "dylib", "bin", "run", "apk",
];
const LOW: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "ico", "svg", "webp", "tif", "tiff", "mp3", "wav", "flac",
    "ogg", "m4a", "mp4", "avi", "mkv", "mov", "webm", "log", "txt",
];

/// Static risk-tier lookup by file extension. Pure function: no I/O, no
/// errors.
pub fn classify(path: &Path) -> PriorityTier {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return PriorityTier::Normal;
    };
    let ext = ext.to_ascii_lowercase();
    let ext = ext.as_str();

    if IMMEDIATE.contains(&ext) {
        PriorityTier::Immediate
    } else if HIGH.contains(&ext) {
        PriorityTier::High
    } else if LOW.contains(&ext) {
        PriorityTier::Low
    } else {
        PriorityTier::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_executables_are_immediate() {
        assert_eq!(classify(Path::new("/tmp/payload.exe")), PriorityTier::Immediate);
        assert_eq!(classify(Path::new("/tmp/driver.SYS")), PriorityTier::Immediate);
    }

    #[test]
    fn test_scripts_are_high() {
        assert_eq!(classify(Path::new("install.sh")), PriorityTier::High);
        assert_eq!(classify(Path::new("macro.PS1")), PriorityTier::High);
    }

    #[test]
    fn test_documents_are_normal() {
        assert_eq!(classify(Path::new("report.docx")), PriorityTier::Normal);
        assert_eq!(classify(Path::new("sheet.xlsx")), PriorityTier::Normal);
        assert_eq!(classify(Path::new("paper.pdf")), PriorityTier::Normal);
    }

    #[test]
    fn test_media_and_logs_are_low() {
        assert_eq!(classify(Path::new("photo.jpg")), PriorityTier::Low);
        assert_eq!(classify(Path::new("system.log")), PriorityTier::Low);
    }

    #[test]
    fn test_unknown_and_missing_extension_default_to_normal() {
        assert_eq!(classify(Path::new("data.xyz123")), PriorityTier::Normal);
        assert_eq!(classify(&PathBuf::from("/usr/local/bin/tool")), PriorityTier::Normal);
    }
}
