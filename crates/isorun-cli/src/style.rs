use std::env;

use color_eyre::owo_colors::OwoColorize;

pub struct Style {
    enabled: bool,
}

impl Style {
    pub fn new(force_no_color: bool, is_tty: bool) -> Self {
        let env_no_color = env::var_os("NO_COLOR").is_some();
        Self {
            enabled: !(force_no_color || env_no_color) && is_tty,
        }
    }

    pub fn error(&self, text: &str) -> String {
        let line = format!("✖ {text}");
        if self.enabled {
            line.red().bold().to_string()
        } else {
            line
        }
    }
}
