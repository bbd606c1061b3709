use tokio::sync::oneshot;

use crate::tls_error::ChannelError;

pub type CompletionResult = Result<(), ChannelError>;

/// One-shot completion signal attached to a write, close or unwrap request.
///
/// Consumed when fired, so each signal fires at most once.
pub struct Completion(Box<dyn FnOnce(CompletionResult) + Send>);

impl Completion {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(CompletionResult) + Send + 'static,
    {
        Completion(Box::new(f))
    }

    /// A completion that reports its result over a oneshot channel.
    pub fn oneshot() -> (Self, oneshot::Receiver<CompletionResult>) {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(move |result| {
            let _ = tx.send(result);
        });
        (completion, rx)
    }

    pub fn complete(self, result: CompletionResult) {
        (self.0)(result)
    }

    pub fn succeed(self) {
        self.complete(Ok(()))
    }

    pub fn fail(self, err: ChannelError) {
        self.complete(Err(err))
    }

    /// Merges several completions into one that fires all of them, in order.
    pub fn combine(mut completions: Vec<Completion>) -> Option<Completion> {
        match completions.len() {
            0 => None,
            1 => completions.pop(),
            _ => Some(Completion::new(move |result| {
                for completion in completions {
                    completion.complete(result.clone());
                }
            })),
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Completion")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_combine_fires_in_order() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let completions = (0..3)
            .map(|i| {
                let fired = fired.clone();
                Completion::new(move |result| fired.lock().push((i, result)))
            })
            .collect();

        Completion::combine(completions).unwrap().fail(ChannelError::AlreadyClosed);

        let fired = fired.lock();
        assert_eq!(fired.len(), 3);
        for (i, (index, result)) in fired.iter().enumerate() {
            assert_eq!(*index, i);
            assert_eq!(*result, Err(ChannelError::AlreadyClosed));
        }
    }

    #[test]
    fn test_combine_empty() {
        assert!(Completion::combine(vec![]).is_none());
    }

    #[tokio::test]
    async fn test_oneshot_completion() {
        let (completion, rx) = Completion::oneshot();
        completion.succeed();
        assert_eq!(rx.await.unwrap(), Ok(()));
    }
}
