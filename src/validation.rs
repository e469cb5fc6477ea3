use crate::caption::Caption;
use crate::error::{Result, TrainError};
use crate::vocab::Vocabulary;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const VALIDATION_FILE: &str = "valid.txt";

/// Header of one block of validation captions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleHeader {
    /// Captions of the model before any training step of this run.
    Initial,
    Progress {
        counter: usize,
        epoch: usize,
        batch: usize,
        n_batches: usize,
    },
}

impl SampleHeader {
    pub fn render(&self, time_of_day: &str) -> String {
        match self {
            SampleHeader::Initial => format!("initial caption {time_of_day}"),
            SampleHeader::Progress {
                counter,
                epoch,
                batch,
                n_batches,
            } => format!("count {counter} epoch {epoch} batch {batch}/{n_batches} ({time_of_day})"),
        }
    }
}

/// Render one caption as `  <i>) <words> (p=<probability>)`.
pub fn format_caption(index: usize, caption: &Caption, vocab: &Vocabulary) -> String {
    let sentence = caption
        .words()
        .iter()
        .map(|&id| vocab.id_to_word(id))
        .collect::<Vec<_>>()
        .join(" ");
    format!("  {index}) {sentence} (p={:.6})", caption.probability())
}

/// Append-only log of captions sampled for the held-out validation image.
pub struct ValidationLog {
    path: PathBuf,
    file: File,
}

impl ValidationLog {
    /// Open (or create) `valid.txt` inside `train_dir` in append mode.
    pub fn open(train_dir: &Path) -> Result<Self> {
        let path = train_dir.join(VALIDATION_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| TrainError::io(&path, err))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a header and one line per caption, then flush.
    pub fn append(
        &mut self,
        header: &SampleHeader,
        captions: &[Caption],
        vocab: &Vocabulary,
    ) -> Result<()> {
        let time_of_day = chrono::Local::now().format("%H:%M:%S").to_string();
        let mut block = header.render(&time_of_day);
        block.push('\n');
        for (index, caption) in captions.iter().enumerate() {
            let line = format_caption(index, caption, vocab);
            tracing::info!("{line}");
            block.push_str(&line);
            block.push('\n');
        }

        self.file
            .write_all(block.as_bytes())
            .and_then(|_| self.file.flush())
            .map_err(|err| TrainError::io(&self.path, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Vocabulary {
        let words = ["<S>", "</S>", "a", "dog", "runs"]
            .iter()
            .map(|w| w.to_string())
            .collect();
        Vocabulary::from_words(words).unwrap()
    }

    fn caption(sentence: Vec<usize>, p: f64) -> Caption {
        Caption {
            sentence,
            state: Vec::new(),
            logprob: p.ln(),
            score: p.ln(),
        }
    }

    #[test]
    fn test_headers() {
        assert_eq!(SampleHeader::Initial.render("12:00:01"), "initial caption 12:00:01");
        let header = SampleHeader::Progress {
            counter: 501,
            epoch: 2,
            batch: 9,
            n_batches: 100,
        };
        assert_eq!(header.render("08:15:00"), "count 501 epoch 2 batch 9/100 (08:15:00)");
    }

    #[test]
    fn test_caption_line_strips_start_and_end() {
        let line = format_caption(1, &caption(vec![0, 2, 3, 4, 1], 0.25), &vocab());
        assert_eq!(line, "  1) a dog runs (p=0.250000)");
    }

    #[test]
    fn test_appends_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let vocab = vocab();
        {
            let mut log = ValidationLog::open(dir.path()).unwrap();
            log.append(&SampleHeader::Initial, &[caption(vec![0, 2, 1], 0.5)], &vocab)
                .unwrap();
        }
        let mut log = ValidationLog::open(dir.path()).unwrap();
        let header = SampleHeader::Progress {
            counter: 1,
            epoch: 0,
            batch: 0,
            n_batches: 10,
        };
        log.append(&header, &[caption(vec![0, 3, 1], 1.0)], &vocab).unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines = contents.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("initial caption "));
        assert_eq!(lines[1], "  0) a (p=0.500000)");
        assert!(lines[2].starts_with("count 1 epoch 0 batch 0/10 ("));
        assert_eq!(lines[3], "  0) dog (p=1.000000)");
    }
}
