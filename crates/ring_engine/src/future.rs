// ring_engine/src/future.rs
//! Waiting for completions from async code
//!
//! ```text
//!  task                         engine
//!  ┌──────────────────┐        ┌──────────────────┐
//!  │ ring.ready(n)    │─poll──►│ cq_ready >= n ?  │
//!  │   .await         │        │  no: register    │
//!  └──────────────────┘        └──────────────────┘
//!          ▲                            │
//!          └──────── wake ── ev_posted ─┘
//! ```
//!
//! The future only observes the completion ring; entries are consumed with
//! [`Context::completion`](crate::Context::completion) as usual.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::sync::Arc;

use crate::context::Ctx;

/// Future resolving once enough completions are visible
///
/// Resolves to the number of completions ready at that point.
#[must_use = "futures do nothing unless polled"]
pub struct CompletionFuture<'a> {
    ctx: &'a Arc<Ctx>,
    min: u32,
}

impl<'a> CompletionFuture<'a> {
    pub(crate) const fn new(ctx: &'a Arc<Ctx>, min: u32) -> Self {
        Self { ctx, min }
    }

    fn ready(&self) -> Option<u32> {
        let n = self.ctx.rings.cq_ready();
        (n >= self.min.max(1)).then_some(n)
    }
}

impl Future for CompletionFuture<'_> {
    type Output = u32;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(n) = self.ready() {
            return Poll::Ready(n);
        }
        self.ctx.waker.register(cx.waker());
        // A completion posted before the registration would be missed.
        match self.ready() {
            Some(n) => Poll::Ready(n),
            None => Poll::Pending,
        }
    }
}

impl core::fmt::Debug for CompletionFuture<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CompletionFuture")
            .field("min", &self.min)
            .field("ready", &self.ctx.rings.cq_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use core::task::Waker;

    use ring_abi::{Params, SetupFlags, SubmissionEntry};

    use super::*;
    use crate::env::OwnerEnv;
    use crate::resource::ResourceMap;

    #[test]
    fn test_future_pending_until_completion() {
        let env = OwnerEnv::new(Arc::new(ResourceMap::new()));
        let mut p = Params::new(SetupFlags::empty());
        p.sq_entries = 2;
        let ring = crate::Context::create(&mut p, env).unwrap();
        let mut cx = Context::from_waker(Waker::noop());

        let mut fut = ring.ready(1);
        assert_eq!(Pin::new(&mut fut).poll(&mut cx), Poll::Pending);

        ring.submission().push(&SubmissionEntry::nop(1)).unwrap();
        ring.enter(1, 0, 0).unwrap();
        assert_eq!(Pin::new(&mut fut).poll(&mut cx), Poll::Ready(1));

        let mut two = ring.ready(2);
        assert_eq!(Pin::new(&mut two).poll(&mut cx), Poll::Pending);
    }
}
