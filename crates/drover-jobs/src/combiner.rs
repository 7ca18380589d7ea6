//! Pluggable folding of per-job results into one topology result.

/// Folds individual job results as they complete.
pub trait ResponseCombiner<R>: Send {
    /// Fold one job's result.
    fn combine(&mut self, response: R);

    /// Consume the combiner and produce the overall result.
    fn finish(self: Box<Self>) -> R;
}

/// Boolean fold: defaults to false, flips true on any true response, and
/// never reverts.
///
/// This is an OR across individual job successes, not an AND. Callers that
/// need "all succeeded" compare healthy counts against the desired count
/// instead of relying on the combined flag.
#[derive(Debug, Default)]
pub struct BooleanResponseCombiner {
    result: bool,
}

impl BooleanResponseCombiner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResponseCombiner<bool> for BooleanResponseCombiner {
    fn combine(&mut self, response: bool) {
        if response {
            self.result = true;
        }
    }

    fn finish(self: Box<Self>) -> bool {
        self.result
    }
}
