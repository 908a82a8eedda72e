use std::path::{Path, PathBuf};

use crate::worker::{DEFAULT_IMAGE_COUNT, SandboxLimits};

/// Persistent playground settings (`key=value` lines).
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// Live-loop refreshes per second.
    pub frame_rate: u32,
    pub default_image_count: u32,
    /// Sent to workers as `value`.
    pub intensity: f64,
    pub record_fps: f32,
    pub record_max_frames: usize,
    pub gif_max_colors: u16,
    pub limits: SandboxLimits,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            frame_rate: 60,
            default_image_count: DEFAULT_IMAGE_COUNT,
            intensity: 1.0,
            record_fps: 30.0,
            record_max_frames: 600,
            gif_max_colors: 256,
            limits: SandboxLimits::default(),
        }
    }
}

impl Settings {
    /// Path to the settings file.
    /// On Linux:   ~/.config/pixelplay/pixelplay_settings.cfg  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\PixelPlay\pixelplay_settings.cfg
    /// On macOS:   ~/Library/Application Support/PixelPlay/pixelplay_settings.cfg
    /// Fallback:   same directory as the executable.
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
                    PathBuf::from(home).join(".config")
                })
                .join("pixelplay");
            let _ = std::fs::create_dir_all(&config_dir);
            return Some(config_dir.join("pixelplay_settings.cfg"));
        }
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA")
                .or_else(|_| std::env::var("USERPROFILE"))
                .unwrap_or_default();
            let config_dir = PathBuf::from(appdata).join("PixelPlay");
            let _ = std::fs::create_dir_all(&config_dir);
            return Some(config_dir.join("pixelplay_settings.cfg"));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
            let config_dir = PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("PixelPlay");
            let _ = std::fs::create_dir_all(&config_dir);
            return Some(config_dir.join("pixelplay_settings.cfg"));
        }
        #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
        {
            std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|d| d.join("pixelplay_settings.cfg")))
        }
    }

    /// Load settings from disk (returns default if file missing or corrupt)
    pub fn load() -> Self {
        let Some(path) = Self::settings_path() else { return Self::default() };
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else { return Self::default() };
        Self::parse(&content)
    }

    /// Parse `key=value` lines; unknown keys and bad values keep defaults.
    pub fn parse(content: &str) -> Self {
        let mut s = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else { continue };
            let key = key.trim();
            let val = val.trim();
            match key {
                "frame_rate" => {
                    if let Ok(v) = val.parse::<u32>() {
                        s.frame_rate = v.clamp(1, 240);
                    }
                }
                "default_image_count" => {
                    if let Ok(v) = val.parse::<u32>()
                        && v > 0
                    {
                        s.default_image_count = v;
                    }
                }
                "intensity" => {
                    if let Ok(v) = val.parse::<f64>()
                        && v.is_finite()
                    {
                        s.intensity = v;
                    }
                }
                "record_fps" => {
                    if let Ok(v) = val.parse::<f32>() {
                        s.record_fps = v.clamp(1.0, 100.0);
                    }
                }
                "record_max_frames" => {
                    if let Ok(v) = val.parse::<usize>() {
                        s.record_max_frames = v.max(1);
                    }
                }
                "gif_max_colors" => {
                    if let Ok(v) = val.parse::<u16>() {
                        s.gif_max_colors = v.clamp(2, 256);
                    }
                }
                "max_operations" => {
                    if let Ok(v) = val.parse::<u64>() {
                        s.limits.max_operations = v;
                    }
                }
                "max_call_levels" => {
                    if let Ok(v) = val.parse::<usize>() {
                        s.limits.max_call_levels = v;
                    }
                }
                "max_expr_depth" => {
                    if let Ok(v) = val.parse::<usize>() {
                        s.limits.max_expr_depth = v;
                    }
                }
                "max_string_size" => {
                    if let Ok(v) = val.parse::<usize>() {
                        s.limits.max_string_size = v;
                    }
                }
                "max_array_size" => {
                    if let Ok(v) = val.parse::<usize>() {
                        s.limits.max_array_size = v;
                    }
                }
                "max_map_size" => {
                    if let Ok(v) = val.parse::<usize>() {
                        s.limits.max_map_size = v;
                    }
                }
                _ => {}
            }
        }
        s
    }

    pub fn to_config_string(&self) -> String {
        let mut content = String::new();
        content.push_str(&format!("frame_rate={}\n", self.frame_rate));
        content.push_str(&format!("default_image_count={}\n", self.default_image_count));
        content.push_str(&format!("intensity={}\n", self.intensity));
        content.push_str(&format!("record_fps={}\n", self.record_fps));
        content.push_str(&format!("record_max_frames={}\n", self.record_max_frames));
        content.push_str(&format!("gif_max_colors={}\n", self.gif_max_colors));
        content.push_str(&format!("max_operations={}\n", self.limits.max_operations));
        content.push_str(&format!("max_call_levels={}\n", self.limits.max_call_levels));
        content.push_str(&format!("max_expr_depth={}\n", self.limits.max_expr_depth));
        content.push_str(&format!("max_string_size={}\n", self.limits.max_string_size));
        content.push_str(&format!("max_array_size={}\n", self.limits.max_array_size));
        content.push_str(&format!("max_map_size={}\n", self.limits.max_map_size));
        content
    }

    /// Save settings to disk
    pub fn save(&self) {
        let Some(path) = Self::settings_path() else { return };
        let _ = std::fs::write(path, self.to_config_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_content_gives_defaults() {
        assert_eq!(Settings::parse(""), Settings::default());
    }

    #[test]
    fn known_keys_are_read() {
        let s = Settings::parse("frame_rate=30\nintensity = 0.5\nmax_operations=1000\n");
        assert_eq!(s.frame_rate, 30);
        assert_eq!(s.intensity, 0.5);
        assert_eq!(s.limits.max_operations, 1000);
    }

    #[test]
    fn malformed_values_and_unknown_keys_are_ignored() {
        let s = Settings::parse("frame_rate=fast\nbogus=1\ndefault_image_count=0\n# comment=3\nno equals sign");
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn saved_text_parses_back() {
        let mut s = Settings::default();
        s.gif_max_colors = 64;
        s.record_max_frames = 12;
        assert_eq!(Settings::parse(&s.to_config_string()), s);
    }
}
