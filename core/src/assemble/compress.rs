//! Per-file compression: keep a head and a tail slice of the text around an
//! explicit elision marker.

use super::tokens::TokenEstimator;

/// Marker placed between the kept head and tail.
pub const ELISION_MARKER: &str = "\n...\n";

/// Text that fits the per-file cap, with its token count.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Fitted {
    pub text: String,
    pub tokens: u64,
    pub compressed: bool,
}

/// Fit `text` under `cap` tokens (`0` = unlimited).
///
/// Returns `None` when even the bare marker exceeds the cap. The kept slice
/// length is the largest `k` (in chars, same on both ends) that fits, so the
/// result depends only on the text, the estimator and the cap.
pub fn fit_to_cap(text: &str, cap: u64, estimator: &dyn TokenEstimator) -> Option<Fitted> {
    let tokens = estimator.estimate(text);
    if cap == 0 || tokens <= cap {
        return Some(Fitted {
            text: text.to_string(),
            tokens,
            compressed: false,
        });
    }

    let chars: Vec<char> = text.chars().collect();
    let render = |k: usize| -> String {
        let head: String = chars[..k].iter().collect();
        let tail: String = chars[chars.len() - k..].iter().collect();
        format!("{head}{ELISION_MARKER}{tail}")
    };
    let fits = |k: usize| estimator.estimate(&render(k)) <= cap;

    if !fits(0) {
        return None;
    }

    // Head and tail never overlap.
    let (mut lo, mut hi) = (0usize, chars.len().saturating_sub(1) / 2);
    while lo < hi {
        let mid = lo + (hi - lo).div_ceil(2);
        if fits(mid) {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }

    let text = render(lo);
    let tokens = estimator.estimate(&text);
    Some(Fitted {
        text,
        tokens,
        compressed: true,
    })
}
