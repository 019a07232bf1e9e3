use async_trait::async_trait;

use crate::error::Result;
use crate::PowerOperation;

// Status lookup for one backend-issued power task. Implemented by the
// backend client; the tracker only decides when to call it.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, vm_id: &str, operation_id: &str) -> Result<PowerOperation>;
}
