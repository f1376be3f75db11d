//! Screen text via a native screenshot and the tesseract CLI.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;
use uuid::Uuid;

use super::{EffectorError, ScreenReader, WordBox};
use crate::config::ConfigHandle;

/// TSV row level for individual words.
const WORD_LEVEL: u32 = 5;
const PAGE_LEVEL: u32 = 1;

/// A screenshot file removed on drop.
struct Screenshot(PathBuf);

impl Drop for Screenshot {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Platform-native screen capture to a PNG file.
fn capture_screen_native(output_path: &Path) -> Result<(), String> {
    let path = output_path.to_string_lossy().to_string();

    #[cfg(target_os = "windows")]
    {
        let ps_script = format!(
            r#"Add-Type -AssemblyName System.Windows.Forms,System.Drawing; $b = [System.Windows.Forms.Screen]::PrimaryScreen.Bounds; $bmp = New-Object System.Drawing.Bitmap($b.Width,$b.Height); $g = [System.Drawing.Graphics]::FromImage($bmp); $g.CopyFromScreen($b.Location,[System.Drawing.Point]::Empty,$b.Size); $bmp.Save('{}'); $g.Dispose(); $bmp.Dispose()"#,
            path.replace('\'', "''")
        );
        let output = Command::new("powershell")
            .args(["-NoProfile", "-NonInteractive", "-Command", &ps_script])
            .output()
            .map_err(|e| format!("Failed to run PowerShell: {}", e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("PowerShell screenshot failed: {}", stderr.trim()));
        }
        Ok(())
    }

    #[cfg(target_os = "macos")]
    {
        let output = Command::new("screencapture")
            .args(["-x", &path])
            .output()
            .map_err(|e| format!("Failed to run screencapture: {}", e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("screencapture failed: {}", stderr.trim()));
        }
        Ok(())
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let attempts: [(&str, Vec<&str>); 3] = [
            ("grim", vec![path.as_str()]),
            ("gnome-screenshot", vec!["-f", path.as_str()]),
            ("import", vec!["-window", "root", path.as_str()]),
        ];
        let mut last_error = String::from("no screenshot tool found");
        for (tool, args) in attempts {
            match Command::new(tool).args(&args).output() {
                Ok(output) if output.status.success() && output_path.exists() => return Ok(()),
                Ok(output) => {
                    last_error = format!(
                        "{} failed: {}",
                        tool,
                        String::from_utf8_lossy(&output.stderr).trim()
                    )
                }
                Err(e) => debug!(tool, "Screenshot tool unavailable: {}", e),
            }
        }
        Err(last_error)
    }
}

/// Parse `tesseract ... tsv` output into word boxes plus the page size.
pub fn parse_tsv(tsv: &str) -> (Option<(i32, i32)>, Vec<WordBox>) {
    let mut page = None;
    let mut words = Vec::new();

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 {
            continue;
        }
        let num = |i: usize| cols[i].trim().parse::<i64>().ok();
        let (Some(level), Some(left), Some(top), Some(width), Some(height)) =
            (num(0), num(6), num(7), num(8), num(9))
        else {
            continue;
        };

        if level == PAGE_LEVEL as i64 {
            page = Some((width as i32, height as i32));
            continue;
        }
        let text = cols[11].trim();
        let conf = cols[10].trim().parse::<f32>().unwrap_or(-1.0);
        if level != WORD_LEVEL as i64 || text.is_empty() || conf < 0.0 {
            continue;
        }
        let block = num(2).unwrap_or(0) as u32;
        let par = num(3).unwrap_or(0) as u32;
        let line = num(4).unwrap_or(0) as u32;
        words.push(WordBox {
            text: text.to_string(),
            left: left as i32,
            top: top as i32,
            width: width as i32,
            height: height as i32,
            line: (block << 20) | (par << 10) | line,
        });
    }
    (page, words)
}

/// Map screenshot pixels to display coordinates (HiDPI screenshots are larger).
pub fn scale_words(words: &mut [WordBox], image: (i32, i32), display: (i32, i32)) {
    if image.0 <= 0 || image.1 <= 0 || image == display {
        return;
    }
    let sx = display.0 as f64 / image.0 as f64;
    let sy = display.1 as f64 / image.1 as f64;
    for w in words {
        w.left = (w.left as f64 * sx).round() as i32;
        w.width = (w.width as f64 * sx).round() as i32;
        w.top = (w.top as f64 * sy).round() as i32;
        w.height = (w.height as f64 * sy).round() as i32;
    }
}

pub struct TesseractReader {
    config: ConfigHandle,
}

impl TesseractReader {
    pub fn new(config: ConfigHandle) -> Self {
        Self { config }
    }

    fn tesseract_bin(&self) -> Result<PathBuf, String> {
        if let Some(path) = self.config.snapshot().tesseract_cmd {
            return if path.exists() {
                Ok(path)
            } else {
                Err(format!("configured tesseract not found at {}", path.display()))
            };
        }
        if let Ok(path) = which::which("tesseract") {
            return Ok(path);
        }
        if cfg!(target_os = "windows") {
            let default = PathBuf::from(r"C:\Program Files\Tesseract-OCR\tesseract.exe");
            if default.exists() {
                return Ok(default);
            }
        }
        Err("tesseract is not installed or not on PATH".into())
    }

    fn screenshot(&self) -> Result<Screenshot, EffectorError> {
        let shot = Screenshot(std::env::temp_dir().join(format!("barbaric-screen-{}.png", Uuid::new_v4())));
        capture_screen_native(&shot.0).map_err(EffectorError::Screen)?;
        Ok(shot)
    }

    fn run_tesseract(&self, image: &Path, tsv: bool) -> Result<String, EffectorError> {
        let bin = self.tesseract_bin().map_err(EffectorError::Ocr)?;
        let mut cmd = Command::new(&bin);
        cmd.arg(image).arg("stdout");
        if tsv {
            cmd.arg("tsv");
        }
        let output = cmd.output()?;
        if !output.status.success() {
            return Err(EffectorError::Ocr(format!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl ScreenReader for TesseractReader {
    fn read_text(&self) -> Result<String, EffectorError> {
        let shot = self.screenshot()?;
        let text = self.run_tesseract(&shot.0, false)?;
        Ok(text.trim().to_string())
    }

    fn read_words(&self) -> Result<Vec<WordBox>, EffectorError> {
        let shot = self.screenshot()?;
        let tsv = self.run_tesseract(&shot.0, true)?;
        let (page, mut words) = parse_tsv(&tsv);
        if let (Some(image), Ok((w, h))) = (page, rdev::display_size()) {
            scale_words(&mut words, image, (w as i32, h as i32));
        }
        debug!(words = words.len(), "OCR word boxes read");
        Ok(words)
    }

    fn check_available(&self) -> Result<(), String> {
        let bin = self.tesseract_bin()?;
        let output = Command::new(&bin)
            .arg("--version")
            .output()
            .map_err(|e| format!("{} failed to execute: {}", bin.display(), e))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(format!("{} --version exited with {}", bin.display(), output.status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    const SAMPLE_TSV: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext
1\t1\t0\t0\t0\t0\t0\t0\t3840\t2160\t-1\t
2\t1\t1\t0\t0\t0\t100\t40\t400\t30\t-1\t
4\t1\t1\t1\t1\t0\t100\t40\t400\t30\t-1\t
5\t1\t1\t1\t1\t1\t100\t40\t80\t30\t96.5\tFile
5\t1\t1\t1\t1\t2\t200\t40\t80\t30\t91.0\tEdit
5\t1\t1\t1\t2\t1\t100\t90\t80\t30\t88.0\tSave
5\t1\t1\t1\t2\t2\t190\t90\t10\t30\t-1\t
bad row
";

    #[test]
    fn test_parse_tsv_words_and_page() {
        let (page, words) = parse_tsv(SAMPLE_TSV);
        assert_eq!(page, Some((3840, 2160)));
        let texts: Vec<&str> = words.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(texts, vec!["File", "Edit", "Save"]);
        assert_eq!(words[0].line, words[1].line);
        assert_ne!(words[1].line, words[2].line);
        assert_eq!((words[1].left, words[1].top), (200, 40));
    }

    #[test]
    fn test_scale_words_for_hidpi() {
        let (page, mut words) = parse_tsv(SAMPLE_TSV);
        scale_words(&mut words, page.unwrap(), (1920, 1080));
        assert_eq!((words[0].left, words[0].top, words[0].width), (50, 20, 40));

        let mut same = words.clone();
        scale_words(&mut same, (1920, 1080), (1920, 1080));
        assert_eq!(same, words);
    }

    #[test]
    fn test_missing_configured_binary_is_unavailable() {
        let mut config = AgentConfig::default();
        config.tesseract_cmd = Some(PathBuf::from("/definitely/not/here/tesseract"));
        let reader = TesseractReader::new(ConfigHandle::new(config));
        let reason = reader.check_available().unwrap_err();
        assert!(reason.contains("not found"));
    }
}
