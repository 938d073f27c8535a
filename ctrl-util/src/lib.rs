// SPDX-License-Identifier: MIT

use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use log::warn;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Error type for reconcilers. Carries any anyhow error transparently so
/// reconcile bodies can use `?` on their plumbing.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ControllerError(#[from] anyhow::Error);

impl From<kube::Error> for ControllerError {
    fn from(err: kube::Error) -> Self {
        ControllerError(err.into())
    }
}

/// Shared error policy: log and requeue after a fixed delay.
pub fn controller_error_policy<K, Ctx>(
    _object: Arc<K>,
    error: &ControllerError,
    _ctx: Arc<Ctx>,
) -> Action {
    warn!("Reconciliation failed, requeueing: {error:#}");
    Action::requeue(ERROR_REQUEUE)
}

/// Terminal logging for `Controller::run` result streams.
pub async fn controller_info<O: Debug, E: Debug>(result: Result<O, E>) {
    match result {
        Ok(o) => log::info!("Reconciled {o:?}"),
        Err(e) => warn!("Reconciliation error: {e:?}"),
    }
}

pub fn name_or_default(metadata: &ObjectMeta) -> String {
    metadata
        .name
        .clone()
        .unwrap_or_else(|| "<unnamed>".to_string())
}

/// Log creation results, treating 409 Conflict as "already exists". Any
/// other error returns from the enclosing function.
#[macro_export]
macro_rules! info_if_exists {
    ($result:expr, $kind:expr, $name:expr) => {
        match $result {
            Ok(o) => ::log::info!("Created {} {:?}", $kind, o.metadata.name),
            Err(::kube::Error::Api(ae)) if ae.code == 409 => {
                ::log::info!("{} {} already exists", $kind, $name)
            }
            Err(e) => return Err(e.into()),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_or_default_falls_back() {
        let named = ObjectMeta {
            name: Some("cb1".to_string()),
            ..Default::default()
        };
        assert_eq!(name_or_default(&named), "cb1");
        assert_eq!(name_or_default(&ObjectMeta::default()), "<unnamed>");
    }

    #[test]
    fn controller_error_wraps_anyhow() {
        let err: ControllerError = anyhow::anyhow!("boom").into();
        assert_eq!(err.to_string(), "boom");
    }
}
