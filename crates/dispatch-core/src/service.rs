use std::{fmt, sync::Arc};

use futures::future::BoxFuture;

use crate::{
    error::QueryFailure,
    types::{QueryResult, SearchTerm},
};

/// Asynchronous lookup behind the pipeline.
///
/// Implementations must be safe to call concurrently. Dropping the returned
/// future abandons the call.
pub trait QueryService: Send + Sync + fmt::Debug {
    fn query<'a>(
        &'a self,
        term: &'a SearchTerm,
    ) -> BoxFuture<'a, Result<QueryResult, QueryFailure>>;
}

pub type SharedQueryService = Arc<dyn QueryService>;
