//! Wire vocabulary shared by `tether-agentd` and `tether-bridge`.
//!
//! Everything here is plain data: the closed set of operations an agent can
//! perform, the permission vocabulary used by plan approval, the structured
//! error body, and the frames exchanged over the relay socket.

pub mod error;
pub mod grant;
pub mod operation;
pub mod relay;

pub use error::{ErrorBody, ErrorCode};
pub use grant::{GrantView, OperationKind, PermissionMode, PlanApproval};
pub use operation::{
    ContentEncoding, CreateArgs, DeleteArgs, EntryKind, ExecArgs, ListArgs, Operation, ReadArgs,
    TransferArgs, WriteArgs,
};
pub use relay::{AgentMetadata, ControlFrame, FrameError, RelayFrame, RelayRequest, RelayResponse};

/// Header carrying the provisioned user id on relay connections.
pub const USER_HEADER: &str = "x-tether-user";

/// Alternative to `Authorization: Bearer` for clients that cannot set it.
pub const SECRET_HEADER: &str = "x-tether-secret";
