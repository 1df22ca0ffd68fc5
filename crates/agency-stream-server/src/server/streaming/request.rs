//! Per-request generation state.
//!
//! Every `GenerationRequest` accepted on a stream is driven by one
//! [`RequestMachine`]:
//!
//! ```text
//! Idle ──begin()──▶ Streaming { sent } ──commit(final)──▶ Completed
//!   │                    │
//!   └─ invalid: stays    └──abort()──▶ Aborted
//! ```
//!
//! The machine only decides *what* to emit next ([`BatchPlan`]); emitting,
//! pacing and cancellation live in the processor.

use crate::server::config::ServerConfig;
use agency_stream_core::{Error, proto::GenerationRequest, types::RequestId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    Streaming { sent: usize },
    Completed,
    Aborted,
}

/// The next batch a streaming request should emit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchPlan {
    /// Number of records in the batch.
    pub take: usize,
    /// Whether this batch completes the request.
    pub is_final: bool,
}

#[derive(Debug)]
pub struct RequestMachine {
    request_id: RequestId,
    requested: i32,
    requested_batch_size: i32,
    total: usize,
    batch_size: usize,
    state: RequestState,
}

impl RequestMachine {
    pub fn new(request: &GenerationRequest) -> Self {
        Self {
            request_id: RequestId::from(request.request_id.as_str()),
            requested: request.count,
            requested_batch_size: request.batch_size,
            total: 0,
            batch_size: 0,
            state: RequestState::Idle,
        }
    }

    /// Validates the request against `config` and moves to
    /// [`RequestState::Streaming`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] (and stays [`RequestState::Idle`]) if
    /// the count is not positive, exceeds `max_records_per_request`, or the
    /// batch size is negative.
    pub fn begin(&mut self, config: &ServerConfig) -> Result<(), Error> {
        if self.state != RequestState::Idle {
            return Err(Error::InvalidRequest {
                reason: format!("request {} already started", self.request_id),
            });
        }

        let total = match usize::try_from(self.requested) {
            Ok(total) if total > 0 => total,
            _ => {
                return Err(Error::InvalidRequest {
                    reason: format!("count must be greater than 0, got {}", self.requested),
                });
            }
        };

        if total > config.max_records_per_request {
            return Err(Error::InvalidRequest {
                reason: format!(
                    "count {total} exceeds maximum allowed ({})",
                    config.max_records_per_request
                ),
            });
        }

        let batch_size = usize::try_from(self.requested_batch_size).map_err(|_| {
            Error::InvalidRequest {
                reason: format!(
                    "batch size must not be negative, got {}",
                    self.requested_batch_size
                ),
            }
        })?;

        self.total = total;
        self.batch_size = if batch_size > 0 {
            batch_size
        } else {
            config.default_batch_size
        };
        self.state = RequestState::Streaming { sent: 0 };
        Ok(())
    }

    /// Returns the next batch to emit, or `None` unless streaming.
    pub fn next_batch(&self) -> Option<BatchPlan> {
        match self.state {
            RequestState::Streaming { sent } if sent < self.total => {
                let take = self.batch_size.min(self.total - sent);
                Some(BatchPlan {
                    take,
                    is_final: sent + take >= self.total,
                })
            }
            _ => None,
        }
    }

    /// Records that `plan` was emitted.
    pub fn commit(&mut self, plan: BatchPlan) {
        if let RequestState::Streaming { sent } = self.state {
            self.state = if plan.is_final {
                RequestState::Completed
            } else {
                RequestState::Streaming {
                    sent: sent + plan.take,
                }
            };
        }
    }

    /// Stops the request. Completed requests stay completed.
    pub fn abort(&mut self) {
        if self.state != RequestState::Completed {
            self.state = RequestState::Aborted;
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Records emitted so far.
    pub fn sent(&self) -> usize {
        match self.state {
            RequestState::Streaming { sent } => sent,
            RequestState::Completed => self.total,
            RequestState::Idle | RequestState::Aborted => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    fn config() -> ServerConfig {
        ServerConfig {
            default_batch_size: 4,
            wait_time: Duration::ZERO,
            max_records_per_request: 1_000,
            stream_buffer_size: 8,
            shutdown_timeout: Duration::from_secs(1),
            server_addr: "127.0.0.1:0".parse().unwrap(),
        }
    }

    fn request(count: i32, batch_size: i32) -> GenerationRequest {
        GenerationRequest {
            request_id: "req-1".into(),
            count,
            batch_size,
        }
    }

    fn drain(machine: &mut RequestMachine) -> Vec<BatchPlan> {
        let mut plans = Vec::new();
        while let Some(plan) = machine.next_batch() {
            machine.commit(plan);
            plans.push(plan);
        }
        plans
    }

    #[test]
    fn splits_twenty_five_into_ten_ten_five() {
        let mut machine = RequestMachine::new(&request(25, 10));
        machine.begin(&config()).unwrap();

        let plans = drain(&mut machine);

        assert_eq!(
            plans.iter().map(|p| p.take).collect::<Vec<_>>(),
            vec![10, 10, 5]
        );
        assert_eq!(
            plans.iter().map(|p| p.is_final).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        assert_eq!(machine.state(), RequestState::Completed);
        assert_eq!(machine.sent(), 25);
    }

    #[test]
    fn exactly_one_final_batch_and_counts_add_up() {
        for count in 1..=40 {
            for batch_size in 0..=12 {
                let mut machine = RequestMachine::new(&request(count, batch_size));
                machine.begin(&config()).unwrap();

                let plans = drain(&mut machine);
                let total: usize = plans.iter().map(|p| p.take).sum();

                assert_eq!(total, count as usize);
                assert_eq!(plans.iter().filter(|p| p.is_final).count(), 1);
                assert!(plans.last().unwrap().is_final);
                assert!(plans.iter().all(|p| p.take > 0));
            }
        }
    }

    #[test]
    fn zero_batch_size_uses_the_server_default() {
        let mut machine = RequestMachine::new(&request(9, 0));
        machine.begin(&config()).unwrap();

        assert_eq!(machine.batch_size(), 4);
        assert_eq!(
            drain(&mut machine).iter().map(|p| p.take).collect::<Vec<_>>(),
            vec![4, 4, 1]
        );
    }

    #[test]
    fn non_positive_counts_stay_idle() {
        for count in [0, -1, i32::MIN] {
            let mut machine = RequestMachine::new(&request(count, 10));

            assert!(matches!(
                machine.begin(&config()),
                Err(Error::InvalidRequest { .. })
            ));
            assert_eq!(machine.state(), RequestState::Idle);
            assert_eq!(machine.next_batch(), None);
        }
    }

    #[test]
    fn rejects_counts_above_the_limit_and_negative_batch_sizes() {
        let mut machine = RequestMachine::new(&request(1_001, 10));
        assert!(machine.begin(&config()).is_err());

        let mut machine = RequestMachine::new(&request(10, -3));
        assert!(machine.begin(&config()).is_err());
        assert_eq!(machine.state(), RequestState::Idle);
    }

    #[test]
    fn abort_stops_emission() {
        let mut machine = RequestMachine::new(&request(25, 10));
        machine.begin(&config()).unwrap();

        let first = machine.next_batch().unwrap();
        machine.commit(first);
        machine.abort();

        assert_eq!(machine.state(), RequestState::Aborted);
        assert_eq!(machine.next_batch(), None);
    }

    #[test]
    fn abort_after_completion_is_ignored() {
        let mut machine = RequestMachine::new(&request(3, 10));
        machine.begin(&config()).unwrap();
        drain(&mut machine);
        machine.abort();

        assert_eq!(machine.state(), RequestState::Completed);
    }
}
