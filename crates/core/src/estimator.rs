//! Token estimation contract.
//!
//! The budget ledger never tokenizes text itself; it asks a
//! [`TokenEstimator`]. Hosts with access to a real tokenizer plug it in
//! here, everyone else gets the character-ratio default from the render
//! crate.

/// Prices a piece of text in tokens.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// Any thread-safe `Fn(&str) -> usize` is an estimator.
impl<F> TokenEstimator for F
where
    F: Fn(&str) -> usize + Send + Sync,
{
    fn estimate(&self, text: &str) -> usize {
        self(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_estimators() {
        let words = |text: &str| text.split_whitespace().count();
        assert_eq!(words.estimate("three small words"), 3);

        let boxed: Box<dyn TokenEstimator> = Box::new(|text: &str| text.len());
        assert_eq!(boxed.estimate("abcd"), 4);
    }
}
