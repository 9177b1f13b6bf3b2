//! Priority tier over single-queue primitives.
//!
//! A priority queue is an ordered list of underlying subqueues indexed
//! `0..K-1`, higher index = higher priority. Receive walks highest-first with
//! zero per-tier wait so an empty high tier never serializes the poll; the
//! caller loops with its own backoff. The single-tier shape degenerates to a
//! plain long poll.
//!
//! Handle → tier is recorded on receive so later acks from the same process
//! route without a priority; out-of-process callers (the reclaimer observed
//! the handle in the state table, it never received the message) must supply
//! the originating priority.

use crate::{Error, QueueMessage, QueueSend, Result, SendReport, TaskQueue};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

pub struct PriorityQueue {
    tiers: Vec<Arc<dyn TaskQueue>>,
    handle_tier: Mutex<HashMap<String, usize>>,
}

impl PriorityQueue {
    pub fn new(tiers: Vec<Arc<dyn TaskQueue>>) -> Result<Self> {
        if tiers.is_empty() {
            return Err(Error::msg("priority queue needs at least one tier"));
        }
        Ok(Self {
            tiers,
            handle_tier: Mutex::new(HashMap::new()),
        })
    }

    pub fn single(queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            tiers: vec![queue],
            handle_tier: Mutex::new(HashMap::new()),
        }
    }

    pub fn tiers(&self) -> usize {
        self.tiers.len()
    }

    fn tier(&self, priority: usize) -> Result<&Arc<dyn TaskQueue>> {
        self.tiers.get(priority).ok_or_else(|| {
            Error::msg(format!(
                "priority {priority} out of range, queue has {} tiers",
                self.tiers.len()
            ))
        })
    }

    pub async fn send(&self, entries: &[QueueSend], priority: usize) -> Result<SendReport> {
        self.tier(priority)?.send(entries).await
    }

    /// Returns the first available message and the tier it came from.
    pub async fn receive(
        &self,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Option<(QueueMessage, usize)>> {
        if self.tiers.len() == 1 {
            let got = self.tiers[0].receive(wait, visibility).await?;
            return Ok(got.map(|msg| {
                self.remember(&msg.handle, 0);
                (msg, 0)
            }));
        }

        for tier in (0..self.tiers.len()).rev() {
            let got = self.tiers[tier].receive(Duration::ZERO, visibility).await?;
            if let Some(msg) = got {
                self.remember(&msg.handle, tier);
                return Ok(Some((msg, tier)));
            }
        }
        Ok(None)
    }

    pub async fn ack(&self, handle: &str, priority: Option<usize>) -> Result<()> {
        let tier = self.resolve(handle, priority)?;
        self.tiers[tier].ack(handle).await?;
        self.forget(handle);
        Ok(())
    }

    pub async fn extend_lease(
        &self,
        handle: &str,
        visibility: Duration,
        priority: Option<usize>,
    ) -> Result<()> {
        let tier = self.resolve(handle, priority)?;
        self.tiers[tier].extend_lease(handle, visibility).await
    }

    /// Depth of one tier, or the sum across all tiers.
    pub async fn depth(&self, priority: Option<usize>) -> Result<i64> {
        match priority {
            Some(priority) => self.tier(priority)?.depth().await,
            None => {
                let mut total = 0;
                for tier in &self.tiers {
                    total += tier.depth().await?;
                }
                Ok(total)
            }
        }
    }

    fn remember(&self, handle: &str, tier: usize) {
        self.handle_tier
            .lock()
            .expect("handle map poisoned")
            .insert(handle.to_string(), tier);
    }

    fn forget(&self, handle: &str) {
        self.handle_tier
            .lock()
            .expect("handle map poisoned")
            .remove(handle);
    }

    fn resolve(&self, handle: &str, priority: Option<usize>) -> Result<usize> {
        if let Some(tier) = self
            .handle_tier
            .lock()
            .expect("handle map poisoned")
            .get(handle)
            .copied()
        {
            return Ok(tier);
        }
        match priority {
            Some(priority) if priority < self.tiers.len() => Ok(priority),
            Some(priority) => Err(Error::msg(format!(
                "priority {priority} out of range, queue has {} tiers",
                self.tiers.len()
            ))),
            None => Err(Error::msg(format!(
                "cannot route handle [{handle}]: not received here and no priority given"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemQueue;

    fn two_tier() -> PriorityQueue {
        PriorityQueue::new(vec![
            Arc::new(MemQueue::new("tasks__0")),
            Arc::new(MemQueue::new("tasks__1")),
        ])
        .unwrap()
    }

    fn entry(id: &str) -> QueueSend {
        QueueSend {
            id: id.to_string(),
            body: format!("{{\"task_id\":\"{id}\"}}"),
        }
    }

    #[tokio::test]
    async fn high_tier_drains_first() -> anyhow::Result<()> {
        let queue = two_tier();
        queue.send(&[entry("low_0"), entry("low_1")], 0).await?;
        queue.send(&[entry("high_0")], 1).await?;

        let (msg, tier) = queue
            .receive(Duration::ZERO, Duration::from_secs(30))
            .await?
            .expect("message available");
        assert_eq!(tier, 1);
        assert!(msg.body.contains("high_0"));

        let (_, tier) = queue
            .receive(Duration::ZERO, Duration::from_secs(30))
            .await?
            .expect("message available");
        assert_eq!(tier, 0);
        Ok(())
    }

    #[tokio::test]
    async fn ack_routes_by_recorded_handle() -> anyhow::Result<()> {
        let queue = two_tier();
        queue.send(&[entry("a")], 1).await?;
        let (msg, _) = queue
            .receive(Duration::ZERO, Duration::from_secs(30))
            .await?
            .expect("message available");

        queue.ack(&msg.handle, None).await?;
        assert_eq!(queue.depth(None).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn foreign_handle_requires_priority() -> anyhow::Result<()> {
        let queue = two_tier();
        queue.send(&[entry("a")], 1).await?;
        let (msg, _) = queue
            .receive(Duration::ZERO, Duration::from_secs(30))
            .await?
            .expect("message available");

        // A second process (the reclaimer) sees the handle only through the
        // state table; without the originating priority it cannot route.
        let other = two_tier();
        other.send(&[entry("a")], 1).await?;
        let (foreign, _) = other
            .receive(Duration::ZERO, Duration::from_secs(30))
            .await?
            .expect("message available");

        assert!(queue.extend_lease(&foreign.handle, Duration::ZERO, None).await.is_err());
        // With the priority supplied, routing succeeds even for unknown handles.
        queue
            .extend_lease(&msg.handle, Duration::ZERO, Some(1))
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn depth_sums_tiers() -> anyhow::Result<()> {
        let queue = two_tier();
        queue.send(&[entry("a"), entry("b")], 0).await?;
        queue.send(&[entry("c")], 1).await?;
        assert_eq!(queue.depth(Some(0)).await?, 2);
        assert_eq!(queue.depth(Some(1)).await?, 1);
        assert_eq!(queue.depth(None).await?, 3);
        assert!(queue.depth(Some(2)).await.is_err());
        Ok(())
    }
}
