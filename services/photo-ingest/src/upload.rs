use crate::error::IngestError;
use crate::record::OutputObject;
use crate::storage::{ObjectStore, RetryPolicy, StorageError};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, instrument};

/// Writes the artifact set of a job concurrently, each object through the
/// retry transport.
pub struct BatchUploader {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    concurrency: usize,
}

impl BatchUploader {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryPolicy, concurrency: usize) -> Self {
        Self {
            store,
            retry,
            concurrency: concurrency.max(1),
        }
    }

    /// Upload every object and wait for all of them. Objects already written
    /// stay in place when another one fails.
    #[instrument(skip(self, objects), fields(object_count = objects.len()))]
    pub async fn upload_all(&self, bucket: &str, objects: Vec<OutputObject>) -> Result<(), IngestError> {
        let results: Vec<(String, Result<(), StorageError>)> = stream::iter(objects)
            .map(|object| async move {
                let result = self
                    .retry
                    .run("put_object", || {
                        self.store.put_object(
                            bucket,
                            &object.key,
                            object.body.clone(),
                            object.content_type,
                        )
                    })
                    .await;
                (object.key, result)
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut first_failure = None;
        for (key, result) in results {
            match result {
                Ok(()) => debug!(bucket, key = %key, "Object uploaded"),
                Err(e) => {
                    error!(bucket, key = %key, error = %e, "Object upload failed");
                    first_failure.get_or_insert(IngestError::UploadFailure { key, source: e });
                }
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
