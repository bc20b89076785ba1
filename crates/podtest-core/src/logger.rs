use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Masked sink for captured container output, progress lines and the
/// final report. Secrets registered with [`JobLogger::add_mask`] are
/// replaced on every emitted line, so output logged after prepare
/// never contains a token value.
#[derive(Clone)]
pub struct JobLogger {
    inner: Arc<Inner>,
}

struct Inner {
    masks: Mutex<Vec<String>>,
    file: Mutex<Option<File>>,
}

impl Default for JobLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl JobLogger {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                masks: Mutex::new(Vec::new()),
                file: Mutex::new(None),
            }),
        }
    }

    /// Mirror every line into the given file in addition to stdout.
    pub fn set_log_file(&self, path: &Path) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *self.inner.file.lock().unwrap() = Some(file);
        Ok(())
    }

    /// Register a secret to be masked from all subsequent output.
    /// The mask list only grows.
    pub fn add_mask(&self, mask: &str) {
        if mask.is_empty() {
            return;
        }
        self.inner.masks.lock().unwrap().push(mask.to_string());
    }

    /// Replace every registered mask in the message with `*` repeated
    /// to the mask's length.
    pub fn filter(&self, msg: &str) -> String {
        let masks = self.inner.masks.lock().unwrap().clone();
        let mut masked = msg.to_string();
        for mask in &masks {
            masked = masked.replace(mask.as_str(), &"*".repeat(mask.len()));
        }
        masked
    }

    /// Emit one masked line.
    pub fn log(&self, msg: &str) {
        let masked = self.filter(msg);
        println!("{}", masked);
        if let Some(file) = self.inner.file.lock().unwrap().as_mut() {
            let _ = writeln!(file, "{}", masked);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_every_occurrence() {
        let logger = JobLogger::new();
        logger.add_mask("s3cret");
        let masked = logger.filter("token=s3cret again s3cret");
        assert_eq!(masked, "token=****** again ******");
    }

    #[test]
    fn masks_accumulate() {
        let logger = JobLogger::new();
        logger.add_mask("alpha");
        logger.add_mask("beta");
        assert_eq!(logger.filter("alpha beta"), "***** ****");
    }

    #[test]
    fn empty_mask_is_ignored() {
        let logger = JobLogger::new();
        logger.add_mask("");
        assert_eq!(logger.filter("untouched"), "untouched");
    }
}
