#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationState {
    Preparing,
    Running,
    Suspended { reason: String },
    Completed,
    Failed,
    Aborted,
}

impl OperationState {
    pub fn status(&self) -> &'static str {
        match self {
            OperationState::Preparing => "PREPARING",
            OperationState::Running => "RUNNING",
            OperationState::Suspended { .. } => "SUSPENDED",
            OperationState::Completed => "COMPLETED",
            OperationState::Failed => "FAILED",
            OperationState::Aborted => "ABORTED",
        }
    }

    /// Whether job events still affect the operation.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OperationState::Running | OperationState::Suspended { .. }
        )
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Failed | OperationState::Aborted
        )
    }
}
