//! Small shims over what differs between native and wasm targets.

use std::future::Future;

pub use instant::Instant;

/// Drives `future` to completion on the current thread.
///
/// Returns `None` on wasm, where blocking the thread is not possible; the future is dropped.
#[cfg(not(target_arch = "wasm32"))]
#[inline]
pub fn block_on<F: Future>(future: F) -> Option<F::Output> {
    Some(futures::executor::block_on(future))
}

#[cfg(target_arch = "wasm32")]
#[inline]
pub fn block_on<F: Future>(future: F) -> Option<F::Output> {
    drop(future);
    None
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_block_on() {
        assert_eq!(super::block_on(async { 1 + 1 }), Some(2));
    }
}
