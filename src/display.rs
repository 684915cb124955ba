use opencv::{core::Mat, highgui};

/// Key that stops every tool.
pub const QUIT_KEY: char = 'q';

/// Delay passed to the key poll after each displayed frame.
pub const KEY_POLL_MS: i32 = 1;

pub fn is_quit_key(key: i32) -> bool {
    key >= 0 && (key & 0xFF) == QUIT_KEY as i32
}

/// highgui windows for the streams a tool shows.
///
/// In headless mode nothing is drawn and the key poll never reports a quit.
pub struct Display {
    headless: bool,
    windows: Vec<String>,
}

impl Display {
    pub fn new(headless: bool) -> Self {
        Display {
            headless,
            windows: Vec::new(),
        }
    }

    pub fn is_headless(&self) -> bool {
        self.headless
    }

    /// Show `image` in the window titled `title`, creating it on first use.
    pub fn show(&mut self, title: &str, image: &Mat) -> opencv::Result<()> {
        if self.headless {
            return Ok(());
        }
        if !self.windows.iter().any(|window| window == title) {
            highgui::named_window(title, highgui::WINDOW_AUTOSIZE)?;
            self.windows.push(title.to_string());
        }
        highgui::imshow(title, image)
    }

    /// Wait briefly for a key press; true if it was the quit key.
    pub fn poll_quit(&self) -> opencv::Result<bool> {
        if self.headless {
            return Ok(false);
        }
        Ok(is_quit_key(highgui::wait_key(KEY_POLL_MS)?))
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        for window in &self.windows {
            let _ = highgui::destroy_window(window);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_q_quits() {
        assert!(is_quit_key('q' as i32));
        // Some backends report modifier bits above the low byte.
        assert!(is_quit_key(0x10_0000 | 'q' as i32));
        assert!(!is_quit_key('Q' as i32));
        assert!(!is_quit_key('x' as i32));
        assert!(!is_quit_key(-1));
    }

    #[test]
    fn headless_display_never_quits() {
        let mut display = Display::new(true);
        display.show("left", &Mat::default()).unwrap();

        assert!(!display.poll_quit().unwrap());
        assert!(display.windows.is_empty());
    }
}
