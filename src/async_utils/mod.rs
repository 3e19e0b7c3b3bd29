//! Asynchronous utilities for use with Tokio.

use std::pin::Pin;

use futures::Stream;
use tokio::io::{self, AsyncWrite};

use crate::prelude::*;

/// A type alias for a boxed future. This is used to make it easier to work with
/// with complex futures.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// A type alias for a boxed stream. This is used to make it easier to work
/// streams that return complex types.
pub type BoxedStream<Item> = Pin<Box<dyn Stream<Item = Item> + Send>>;

/// Open `path` for writing, or standard output if `path` is `None`.
pub async fn create_writer(path: Option<&Path>) -> Result<Box<dyn AsyncWrite + Send + Unpin>> {
    match path {
        Some(path) => {
            let file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create file: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(io::stdout())),
    }
}
