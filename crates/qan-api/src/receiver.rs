//! `qan.v1.Collector` receiver: feeds agent buckets into the buffer.

use std::sync::Arc;

use qan_proto::collector::{self, CollectRequest, CollectResponse, Collector};
use tonic::{Request, Response, Status};

use crate::buffer::Ingester;
use crate::model::Observation;

/// gRPC receiver for agent metric buckets.
///
/// Every bucket is submitted on its own; one bad bucket never fails the
/// rest of the request.
#[derive(Clone)]
pub struct CollectorReceiver {
    ingester: Arc<Ingester>,
}

impl CollectorReceiver {
    pub const fn new(ingester: Arc<Ingester>) -> Self {
        Self { ingester }
    }
}

#[tonic::async_trait]
impl Collector for CollectorReceiver {
    async fn collect(
        &self,
        request: Request<CollectRequest>,
    ) -> Result<Response<CollectResponse>, Status> {
        let buckets = request.into_inner().metrics_bucket;
        let mut response = CollectResponse::default();

        for (index, bucket) in (0u32..).zip(buckets) {
            match self.ingester.submit(Observation::from(bucket)) {
                Ok(()) => response.accepted += 1,
                Err(rejection) => {
                    tracing::debug!(index, reason = rejection.reason(), "Rejected bucket");
                    response.rejected += 1;
                    response.rejections.push(collector::Rejection {
                        index,
                        reason: rejection.to_string(),
                    });
                }
            }
        }

        if response.rejected > 0 {
            tracing::warn!(
                accepted = response.accepted,
                rejected = response.rejected,
                "Collect request partially rejected"
            );
        }

        Ok(Response::new(response))
    }
}
