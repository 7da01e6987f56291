use courier_core::TenantId;

use crate::platform::PlatformEvent;

/// Types that belong to exactly one tenant.
///
/// Fan-out refuses an event whose tenant differs from the job it runs under.
pub trait TenantScoped {
    fn tenant_id(&self) -> TenantId;
}

impl TenantScoped for PlatformEvent {
    fn tenant_id(&self) -> TenantId {
        match self {
            PlatformEvent::MessageReceived(e) => e.tenant_id,
            PlatformEvent::MessageStatusUpdated(e) => e.tenant_id,
        }
    }
}
