//! N-way barrier across processes, built from `2 * n_ranks` shared events.
//!
//! Event `rank` is the rank's arrival flag: the participant signals it, the
//! coordinator waits on it and resets it. Event `n_ranks + rank` is the
//! release flag: the coordinator signals it, the participant waits on it and
//! resets it. Every event therefore has exactly one signaller and one
//! resetter, and a round cannot start until the previous one's events are
//! reset.

use crate::backend::ComputeBackend;
use crate::error::{Error, Result};
use crate::util::Deadline;
use std::fmt;
use std::time::Duration;

/// The events of one barrier, as seen from one process.
pub struct BarrierEvents<'b, B: ComputeBackend> {
    backend: &'b B,
    events: Vec<B::Event>,
    n_ranks: u32,
}

impl<'b, B: ComputeBackend> BarrierEvents<'b, B> {
    /// Creates the `2 * n_ranks` events from `pool`.
    pub fn new(backend: &'b B, pool: &B::EventPool, n_ranks: u32) -> Result<Self> {
        if n_ranks == 0 {
            return Err(Error::invalid_args("a barrier needs at least one rank"));
        }
        let needed = 2 * n_ranks;
        let available = backend.event_pool_len(pool);
        if available < needed {
            return Err(Error::backend(format!(
                "barrier for {n_ranks} ranks needs {needed} events, pool has {available}"
            )));
        }

        let events = (0..needed)
            .map(|index| backend.create_event(pool, index))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            backend,
            events,
            n_ranks,
        })
    }

    pub fn n_ranks(&self) -> u32 {
        self.n_ranks
    }

    pub fn arrive(&self, rank: u32) -> &B::Event {
        &self.events[rank as usize]
    }

    pub fn release(&self, rank: u32) -> &B::Event {
        &self.events[(self.n_ranks + rank) as usize]
    }

    pub fn backend(&self) -> &'b B {
        self.backend
    }

    fn check_rank(&self, rank: u32) -> Result<()> {
        if rank >= self.n_ranks {
            return Err(Error::invalid_args(format!(
                "rank {rank} outside barrier of {} ranks",
                self.n_ranks
            )));
        }
        Ok(())
    }
}

impl<B: ComputeBackend> fmt::Debug for BarrierEvents<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BarrierEvents")
            .field("n_ranks", &self.n_ranks)
            .field("events", &self.events.len())
            .finish()
    }
}

/// Coordinator side: gathers every participant, then releases them.
#[derive(Debug)]
pub struct Coordinator<'b, B: ComputeBackend> {
    events: BarrierEvents<'b, B>,
    rounds: u64,
}

impl<'b, B: ComputeBackend> Coordinator<'b, B> {
    pub fn new(events: BarrierEvents<'b, B>) -> Self {
        Self { events, rounds: 0 }
    }

    /// Waits for every rank's arrival in ascending order, resetting each
    /// arrival flag once seen. `timeout` bounds the whole gather.
    pub fn wait_for_all(&self, timeout: Duration) -> Result<()> {
        let deadline = Deadline::after(timeout);
        let backend = self.events.backend;

        for rank in 0..self.events.n_ranks {
            let arrive = self.events.arrive(rank);
            backend.wait(arrive, deadline.remaining()).map_err(|e| match e {
                Error::Timeout(..) => Error::timeout(
                    timeout,
                    format!("rank {rank} to reach barrier round {}", self.rounds),
                ),
                other => other,
            })?;
            backend.reset(arrive)?;
        }
        Ok(())
    }

    pub fn release_all(&self) -> Result<()> {
        let backend = self.events.backend;
        for rank in 0..self.events.n_ranks {
            backend.signal(self.events.release(rank))?;
        }
        Ok(())
    }

    /// One full round: gather, then release.
    pub fn round(&mut self, timeout: Duration) -> Result<()> {
        self.wait_for_all(timeout)?;
        self.release_all()?;
        tracing::trace!(round = self.rounds, "barrier round complete");
        self.rounds += 1;
        Ok(())
    }

    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    pub fn events(&self) -> &BarrierEvents<'b, B> {
        &self.events
    }
}

/// Participant side, one per rank.
#[derive(Debug)]
pub struct Participant<'b, B: ComputeBackend> {
    events: BarrierEvents<'b, B>,
    rank: u32,
    rounds: u64,
}

impl<'b, B: ComputeBackend> Participant<'b, B> {
    pub fn new(events: BarrierEvents<'b, B>, rank: u32) -> Result<Self> {
        events.check_rank(rank)?;
        Ok(Self {
            events,
            rank,
            rounds: 0,
        })
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Announces arrival and blocks until the coordinator releases this
    /// rank, then re-arms the release flag.
    pub fn arrive_and_wait(&mut self, timeout: Duration) -> Result<()> {
        let backend = self.events.backend;
        let release = self.events.release(self.rank);

        backend.signal(self.events.arrive(self.rank))?;
        backend.wait(release, timeout).map_err(|e| match e {
            Error::Timeout(..) => Error::timeout(
                timeout,
                format!(
                    "coordinator to release rank {} from barrier round {}",
                    self.rank, self.rounds
                ),
            ),
            other => other,
        })?;
        backend.reset(release)?;

        self.rounds += 1;
        Ok(())
    }

    pub fn rounds(&self) -> u64 {
        self.rounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;
    use std::thread;

    #[test]
    fn test_pool_too_small() {
        let backend = HostBackend::new();
        let pool = backend.create_event_pool(3).unwrap();
        assert!(BarrierEvents::new(&backend, &pool, 2).is_err());
        assert!(BarrierEvents::new(&backend, &pool, 0).is_err());
    }

    #[test]
    fn test_two_rank_round_resets_all_events() {
        let backend = HostBackend::new();
        let pool = backend.create_event_pool(4).unwrap();
        let timeout = Duration::from_secs(5);

        let mut coordinator = Coordinator::new(BarrierEvents::new(&backend, &pool, 2).unwrap());

        thread::scope(|s| {
            for rank in 0..2 {
                let backend = &backend;
                let pool = &pool;
                s.spawn(move || {
                    let events = BarrierEvents::new(backend, pool, 2).unwrap();
                    let mut participant = Participant::new(events, rank).unwrap();
                    for _ in 0..3 {
                        participant.arrive_and_wait(timeout).unwrap();
                    }
                    assert_eq!(participant.rounds(), 3);
                });
            }
            for _ in 0..3 {
                coordinator.round(timeout).unwrap();
            }
        });

        assert_eq!(coordinator.rounds(), 3);
        let events = coordinator.events();
        for rank in 0..2 {
            assert!(!backend.is_signaled(events.arrive(rank)).unwrap());
            assert!(!backend.is_signaled(events.release(rank)).unwrap());
        }
    }

    #[test]
    fn test_missing_participant_times_out() {
        let backend = HostBackend::new();
        let pool = backend.create_event_pool(4).unwrap();
        let coordinator = Coordinator::new(BarrierEvents::new(&backend, &pool, 2).unwrap());

        let mut participant =
            Participant::new(BarrierEvents::new(&backend, &pool, 2).unwrap(), 0).unwrap();
        assert!(participant
            .arrive_and_wait(Duration::from_millis(10))
            .unwrap_err()
            .is_timeout());

        let err = coordinator.wait_for_all(Duration::from_millis(20)).unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("rank 1"));
    }

    #[test]
    fn test_participant_rank_out_of_range() {
        let backend = HostBackend::new();
        let pool = backend.create_event_pool(2).unwrap();
        let events = BarrierEvents::new(&backend, &pool, 1).unwrap();
        assert!(matches!(
            Participant::new(events, 1),
            Err(Error::InvalidArgs(_))
        ));
    }
}
