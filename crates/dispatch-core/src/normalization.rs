use crate::{
    error::QueryFailure,
    types::{QueryResult, SearchTerm},
};

/// A result ready for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub result: QueryResult,
    /// `true` when `result` is a synthesized failure placeholder.
    pub placeholder: bool,
}

/// Convert one execution outcome into what is rendered downstream.
///
/// Terminal failures become `Query(<term>) <reason>` placeholders.
/// Cancellation yields `None`: superseded queries render nothing.
pub fn normalize_outcome(
    term: &SearchTerm,
    outcome: Result<QueryResult, QueryFailure>,
) -> Option<Delivery> {
    match outcome {
        Ok(result) => Some(Delivery {
            result,
            placeholder: false,
        }),
        Err(failure) => {
            let reason = failure.placeholder_reason()?;
            Some(Delivery {
                result: QueryResult::error_placeholder(term.clone(), reason),
                placeholder: true,
            })
        }
    }
}
