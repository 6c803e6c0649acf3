use flowrelay_core::FlowId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("flow not found: {0}")]
    NotFound(FlowId),
}
