use crate::error::Result;

/// Token probabilities below this are never expanded.
const MIN_WORD_PROBABILITY: f32 = 1e-12;

/// A single decoding step interface over a trained caption model.
///
/// States are opaque flat vectors so the search does not depend on the
/// backend's tensor types.
pub trait StepModel {
    /// Decoder state after the image has been fed.
    fn initial_state(&self, image: &[f32]) -> Result<Vec<f32>>;

    /// Run one step for a batch of `(last token, state)` pairs, returning the
    /// next-token probabilities and the updated state for each.
    fn step(&self, tokens: &[usize], states: &[Vec<f32>]) -> Result<Vec<(Vec<f32>, Vec<f32>)>>;
}

/// A complete or partial caption produced by beam search.
#[derive(Debug, Clone)]
pub struct Caption {
    /// Token ids including the start token (and the end token when complete).
    pub sentence: Vec<usize>,
    pub state: Vec<f32>,
    pub logprob: f64,
    pub score: f64,
}

impl Caption {
    pub fn probability(&self) -> f64 {
        self.logprob.exp()
    }

    /// Token ids without the leading start token and trailing end token.
    pub fn words(&self) -> &[usize] {
        match self.sentence.len() {
            0 | 1 => &[],
            n => &self.sentence[1..n - 1],
        }
    }
}

/// Keeps the `n` highest scoring captions.
struct TopN {
    n: usize,
    items: Vec<Caption>,
}

impl TopN {
    fn new(n: usize) -> Self {
        Self {
            n,
            items: Vec::with_capacity(n + 1),
        }
    }

    fn push(&mut self, caption: Caption) {
        self.items.push(caption);
        if self.items.len() > self.n {
            self.sort();
            self.items.truncate(self.n);
        }
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn sort(&mut self) {
        self.items
            .sort_by(|a, b| b.score.total_cmp(&a.score));
    }

    fn extract(mut self) -> Vec<Caption> {
        self.sort();
        self.items
    }
}

/// Beam search settings.
#[derive(Debug, Clone)]
pub struct CaptionGenerator {
    pub start_id: usize,
    pub end_id: usize,
    pub beam_size: usize,
    pub max_caption_length: usize,
    /// Complete captions are scored `logprob / len^factor`; 0 disables it.
    pub length_normalization_factor: f64,
}

impl CaptionGenerator {
    pub fn new(start_id: usize, end_id: usize) -> Self {
        Self {
            start_id,
            end_id,
            beam_size: 3,
            max_caption_length: 20,
            length_normalization_factor: 0.0,
        }
    }

    pub fn with_beam_size(mut self, beam_size: usize) -> Self {
        self.beam_size = beam_size.max(1);
        self
    }

    pub fn with_max_caption_length(mut self, max_caption_length: usize) -> Self {
        self.max_caption_length = max_caption_length;
        self
    }

    pub fn with_length_normalization_factor(mut self, factor: f64) -> Self {
        self.length_normalization_factor = factor;
        self
    }

    /// Run beam search and return captions sorted by descending score.
    pub fn beam_search(&self, model: &impl StepModel, image: &[f32]) -> Result<Vec<Caption>> {
        let initial = Caption {
            sentence: vec![self.start_id],
            state: model.initial_state(image)?,
            logprob: 0.0,
            score: 0.0,
        };

        let mut partial = TopN::new(self.beam_size);
        partial.push(initial);
        let mut complete = TopN::new(self.beam_size);

        for _ in 0..self.max_caption_length.saturating_sub(1) {
            let beams = partial.extract();
            partial = TopN::new(self.beam_size);

            let tokens = beams
                .iter()
                .map(|c| *c.sentence.last().unwrap_or(&self.start_id))
                .collect::<Vec<_>>();
            let states = beams.iter().map(|c| c.state.clone()).collect::<Vec<_>>();
            let outputs = model.step(&tokens, &states)?;

            for (beam, (probs, state)) in beams.iter().zip(outputs) {
                for word in top_k(&probs, self.beam_size) {
                    let p = probs[word];
                    if p < MIN_WORD_PROBABILITY {
                        continue;
                    }
                    let mut sentence = beam.sentence.clone();
                    sentence.push(word);
                    let logprob = beam.logprob + f64::from(p).ln();
                    let mut score = logprob;
                    if word == self.end_id {
                        if self.length_normalization_factor > 0.0 {
                            score /= (sentence.len() as f64).powf(self.length_normalization_factor);
                        }
                        complete.push(Caption {
                            sentence,
                            state: state.clone(),
                            logprob,
                            score,
                        });
                    } else {
                        partial.push(Caption {
                            sentence,
                            state: state.clone(),
                            logprob,
                            score,
                        });
                    }
                }
            }

            if partial.len() == 0 {
                break;
            }
        }

        // Fall back to unfinished captions if none reached the end token.
        if complete.len() == 0 {
            complete = partial;
        }
        Ok(complete.extract())
    }
}

/// Indices of the `k` largest probabilities, largest first.
fn top_k(probs: &[f32], k: usize) -> Vec<usize> {
    let mut indices = (0..probs.len()).collect::<Vec<_>>();
    indices.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
    indices.truncate(k);
    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Fixed transition table: next-token distribution depends only on the last token.
    struct TableModel {
        vocab_size: usize,
        table: HashMap<usize, Vec<(usize, f32)>>,
    }

    impl TableModel {
        fn distribution(&self, token: usize) -> Vec<f32> {
            let mut probs = vec![0.0; self.vocab_size];
            for &(word, p) in self.table.get(&token).into_iter().flatten() {
                probs[word] = p;
            }
            probs
        }
    }

    impl StepModel for TableModel {
        fn initial_state(&self, image: &[f32]) -> Result<Vec<f32>> {
            Ok(image.to_vec())
        }

        fn step(&self, tokens: &[usize], states: &[Vec<f32>]) -> Result<Vec<(Vec<f32>, Vec<f32>)>> {
            Ok(tokens
                .iter()
                .zip(states)
                .map(|(&t, s)| (self.distribution(t), s.clone()))
                .collect())
        }
    }

    // ids: 0 = <S>, 1 = </S>, 2 = "a", 3 = "dog", 4 = "cat"
    fn model() -> TableModel {
        let mut table = HashMap::new();
        table.insert(0, vec![(2, 0.9), (4, 0.1)]);
        table.insert(2, vec![(3, 0.6), (4, 0.4)]);
        table.insert(3, vec![(1, 1.0)]);
        table.insert(4, vec![(1, 1.0)]);
        TableModel {
            vocab_size: 5,
            table,
        }
    }

    #[test]
    fn test_best_caption_first() {
        let generator = CaptionGenerator::new(0, 1).with_beam_size(3);
        let captions = generator.beam_search(&model(), &[0.5]).unwrap();

        assert_eq!(captions[0].sentence, vec![0, 2, 3, 1]);
        assert_eq!(captions[0].words(), &[2, 3]);
        assert!((captions[0].probability() - 0.54).abs() < 1e-6);
        assert!(captions.windows(2).all(|w| w[0].score >= w[1].score));
        assert_eq!(captions.len(), 3);
    }

    #[test]
    fn test_returns_partial_captions_when_length_limit_hits() {
        let generator = CaptionGenerator::new(0, 1).with_max_caption_length(2);
        let captions = generator.beam_search(&model(), &[]).unwrap();

        assert!(!captions.is_empty());
        assert_eq!(captions[0].sentence, vec![0, 2]);
        assert!(captions.iter().all(|c| !c.sentence.contains(&1)));
    }

    #[test]
    fn test_length_normalization_changes_scores_only_for_complete() {
        let generator = CaptionGenerator::new(0, 1).with_length_normalization_factor(1.0);
        let captions = generator.beam_search(&model(), &[]).unwrap();
        let best = &captions[0];
        assert!((best.score - best.logprob / best.sentence.len() as f64).abs() < 1e-9);
    }

    #[test]
    fn test_top_k_orders_by_probability() {
        assert_eq!(top_k(&[0.1, 0.5, 0.2, 0.2], 2)[0], 1);
        assert_eq!(top_k(&[0.1], 3), vec![0]);
    }
}
