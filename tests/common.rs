#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bulkdb::codec::{encode_results, unpack_operations};
use bulkdb::retry::{bulk_policy_factory, no_retry_factory};
use bulkdb::transport::{WireRequest, WireResponse};
use bulkdb::{
    BulkClient, BulkConfig, ContainerId, Dispatcher, DispatcherParts, JsonSerializer,
    MemoryBackend, OperationResult, PartitionRouter, RangeId, Result, StatusCode, Transport,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

pub const FLUSH: Duration = Duration::from_millis(10);

pub fn test_config() -> BulkConfig {
    BulkConfig::default().with_flush_interval(FLUSH)
}

pub fn memory_backend(ranges: usize) -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::new(ranges))
}

pub fn memory_client(ranges: usize, config: BulkConfig) -> (BulkClient, Arc<MemoryBackend>) {
    let backend = memory_backend(ranges);
    let client = BulkClient::new(backend.clone(), backend.clone(), config).expect("valid config");
    (client, backend)
}

/// Dispatcher over any transport, routed by a memory backend.
pub fn dispatcher_with(
    transport: Arc<dyn Transport>,
    router: Arc<dyn PartitionRouter>,
    config: BulkConfig,
    retry: bool,
) -> Dispatcher {
    let retry_policies = if retry {
        bulk_policy_factory(config.retry.clone())
    } else {
        no_retry_factory()
    };
    let parts = DispatcherParts {
        config,
        transport,
        router,
        serializer: Arc::new(JsonSerializer),
        retry_policies,
    };
    Dispatcher::new(ContainerId::from("items"), parts, &CancellationToken::new())
        .expect("valid config")
}

/// Calls currently on the wire and the most seen at once.
#[derive(Default)]
struct InFlight {
    per_range: HashMap<RangeId, usize>,
    peak_per_range: HashMap<RangeId, usize>,
    total: usize,
    peak_total: usize,
}

/// Transport that answers every operation with a fixed status and records
/// the operation count of each request.
pub struct ScriptedTransport {
    status: StatusCode,
    pub requests: Mutex<Vec<(RangeId, usize)>>,
    latency: Option<Duration>,
    in_flight: Mutex<InFlight>,
}

impl ScriptedTransport {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            requests: Mutex::new(Vec::new()),
            latency: None,
            in_flight: Mutex::new(InFlight::default()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn request_sizes(&self) -> Vec<usize> {
        self.requests.lock().iter().map(|(_, n)| *n).collect()
    }

    /// Most calls ever on the wire at once for `range`.
    pub fn peak_in_flight(&self, range: &RangeId) -> usize {
        self.in_flight
            .lock()
            .peak_per_range
            .get(range)
            .copied()
            .unwrap_or(0)
    }

    /// Most calls ever on the wire at once across all ranges.
    pub fn peak_in_flight_total(&self) -> usize {
        self.in_flight.lock().peak_total
    }

    fn enter(&self, range: &RangeId) {
        let mut state = self.in_flight.lock();
        let current = {
            let count = state.per_range.entry(range.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let peak = state.peak_per_range.entry(range.clone()).or_insert(0);
        *peak = (*peak).max(current);
        state.total += 1;
        state.peak_total = state.peak_total.max(state.total);
    }

    fn leave(&self, range: &RangeId) {
        let mut state = self.in_flight.lock();
        if let Some(count) = state.per_range.get_mut(range) {
            *count -= 1;
        }
        state.total -= 1;
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        request: WireRequest,
        _cancel: &CancellationToken,
    ) -> Result<WireResponse> {
        let ops = unpack_operations(&request.body)?;
        let range = match &request.target {
            bulkdb::transport::RequestTarget::Range(range) => {
                self.requests.lock().push((range.clone(), ops.len()));
                range.clone()
            }
            bulkdb::transport::RequestTarget::PartitionKey(pk) => RangeId::from(pk.as_str()),
        };
        self.enter(&range);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.leave(&range);
        let results = vec![OperationResult::new(self.status); ops.len()];
        Ok(WireResponse::new(StatusCode::OK, encode_results(&results)))
    }
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
