use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::AppResult;
use crate::modules::system::Logger;

/// One entrant in a probe race. The token is handed to the probe function,
/// which must stop promptly when it fires.
#[derive(Debug)]
pub struct ProbeCandidate<A> {
    pub value: A,
    pub cancel: CancellationToken,
}

impl<A> ProbeCandidate<A> {
    pub fn new(value: A) -> Self {
        Self {
            value,
            cancel: CancellationToken::new(),
        }
    }
}

/// The winning candidate's position and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeWin<T> {
    pub candidate_index: usize,
    pub value: T,
}

/// Race all candidates; the first success wins and every other candidate is
/// cancelled exactly once. A failure never cancels anyone (the rest may
/// still win), and once a winner is declared late results are ignored. If
/// every candidate fails, there is no result. Per-candidate errors are
/// debug-level noise, never propagated.
pub async fn probe_first_success<A, T, F, Fut>(
    candidates: Vec<ProbeCandidate<A>>,
    probe: F,
) -> Option<ProbeWin<T>>
where
    A: Send + 'static,
    T: Send + 'static,
    F: Fn(A, CancellationToken) -> Fut,
    Fut: std::future::Future<Output = AppResult<T>> + Send + 'static,
{
    let logger = Logger::scoped("prober");
    match candidates.len() {
        0 => None,
        1 => {
            let candidate = candidates.into_iter().next().expect("one candidate");
            match probe(candidate.value, candidate.cancel).await {
                Ok(value) => Some(ProbeWin {
                    candidate_index: 0,
                    value,
                }),
                Err(e) => {
                    logger.debug(&format!("sole probe candidate failed: {}", e), None);
                    None
                }
            }
        }
        n => {
            let (tx, mut rx) = mpsc::unbounded_channel::<(usize, AppResult<T>)>();
            let mut tokens = Vec::with_capacity(n);
            for (index, candidate) in candidates.into_iter().enumerate() {
                tokens.push(candidate.cancel.clone());
                let fut = probe(candidate.value, candidate.cancel);
                let tx = tx.clone();
                tokio::spawn(async move {
                    // A loser may resolve after the race is settled; the
                    // receiver is gone by then and the send just drops.
                    let _ = tx.send((index, fut.await));
                });
            }
            drop(tx);

            let mut failures = 0;
            while let Some((index, outcome)) = rx.recv().await {
                match outcome {
                    Ok(value) => {
                        for (loser, token) in tokens.iter().enumerate() {
                            if loser != index {
                                token.cancel();
                            }
                        }
                        return Some(ProbeWin {
                            candidate_index: index,
                            value,
                        });
                    }
                    Err(e) => {
                        logger.debug(&format!("probe candidate {} failed: {}", index, e), None);
                        failures += 1;
                        if failures == n {
                            return None;
                        }
                    }
                }
            }
            None
        }
    }
}
