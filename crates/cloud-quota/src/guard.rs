//! RAII reservation guard: a dropped guard that was never `commit`ted
//! spawns its own rollback rather than relying on the caller to
//! remember, so a cancelled handler can never leak a held reservation.

use std::sync::Arc;

use tracing::warn;

use crate::engine::QuotaEngine;

/// Holds one outstanding quota reservation. Call [`QuotaReservationGuard::commit`]
/// on the success path; on any other return (including early `?`
/// propagation or task cancellation) `Drop` rolls the reservation back.
pub struct QuotaReservationGuard {
    engine: Arc<QuotaEngine>,
    reservation_id: Option<String>,
}

impl QuotaReservationGuard {
    pub fn new(engine: Arc<QuotaEngine>, reservation_id: String) -> Self {
        QuotaReservationGuard {
            engine,
            reservation_id: Some(reservation_id),
        }
    }

    pub fn reservation_id(&self) -> &str {
        self.reservation_id.as_deref().expect("guard already consumed")
    }

    /// Folds the reservation into the durable counter. Consumes the
    /// guard so `Drop` does not also try to roll it back.
    pub async fn commit(mut self) -> cloud_core::error::Result<()> {
        let id = self.reservation_id.take().expect("guard already consumed");
        self.engine.commit(&id).await
    }
}

impl Drop for QuotaReservationGuard {
    fn drop(&mut self) {
        let Some(id) = self.reservation_id.take() else { return };
        let engine = self.engine.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.rollback(&id).await {
                warn!(reservation_id = %id, error = %e, "failed to roll back quota reservation on drop");
            }
        });
    }
}
