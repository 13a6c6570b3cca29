//! Pooled send requests.

use crate::error::NetResult;
use crate::handle::{NmHandle, SendCb};
use bytes::Bytes;
use std::sync::{Mutex, PoisonError};
use tokio::time::Instant;

/// One outstanding send
pub(crate) struct SendRequest {
    pub(crate) handle: Option<NmHandle>,
    pub(crate) data: Bytes,
    pub(crate) offset: usize,
    pub(crate) deadline: Option<Instant>,
    cb: Option<SendCb>,
}

impl SendRequest {
    fn empty() -> Self {
        Self {
            handle: None,
            data: Bytes::new(),
            offset: 0,
            deadline: None,
            cb: None,
        }
    }

    /// Bytes not yet written
    pub(crate) fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.data.len());
    }

    pub(crate) fn is_done(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn reset(&mut self) {
        self.handle = None;
        self.data = Bytes::new();
        self.offset = 0;
        self.deadline = None;
        self.cb = None;
    }
}

/// Free list of send requests shared by all workers
pub(crate) struct RequestPool {
    free: Mutex<Vec<Box<SendRequest>>>,
    capacity: usize,
}

impl RequestPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    /// Take a request for `handle`, reusing a pooled one when available
    pub(crate) fn get(&self, handle: NmHandle, data: Bytes, cb: SendCb) -> Box<SendRequest> {
        let pooled = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let mut req = pooled.unwrap_or_else(|| Box::new(SendRequest::empty()));
        req.handle = Some(handle);
        req.data = data;
        req.cb = Some(cb);
        req
    }

    /// Return `req` to the pool, then run its callback
    pub(crate) fn complete(&self, mut req: Box<SendRequest>, result: NetResult<()>) {
        let cb = req.cb.take();
        let handle = req.handle.take();
        req.reset();
        {
            let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
            if free.len() < self.capacity {
                free.push(req);
            }
        }

        if let (Some(cb), Some(handle)) = (cb, handle) {
            cb(&handle, result);
        }
    }

    #[cfg(test)]
    pub(crate) fn pooled(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_progress() {
        let mut req = SendRequest::empty();
        req.data = Bytes::from_static(b"abcdef");
        assert_eq!(req.remaining(), b"abcdef");
        req.advance(4);
        assert_eq!(req.remaining(), b"ef");
        assert!(!req.is_done());
        req.advance(10);
        assert!(req.is_done());
        assert!(req.remaining().is_empty());
    }

    #[test]
    fn test_pool_capacity() {
        let pool = RequestPool::new(1);
        pool.complete(Box::new(SendRequest::empty()), Ok(()));
        pool.complete(Box::new(SendRequest::empty()), Ok(()));
        assert_eq!(pool.pooled(), 1);
    }
}
