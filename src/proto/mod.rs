//! Tier message builders and parsers
//!
//! One builder + parser pair per (action, state), selected through a single
//! exhaustive match that replaces per-transition function-pointer juggling.
//! Builders turn an operation context into an outbound [`Frame`]; parsers
//! consume the response frame, mutate the context, and name the next state.

pub mod ds;
pub mod ms;
pub mod ns;
pub mod rc;
pub mod rs;

use crate::codec::{Frame, MessageType, StatusMsg};
use crate::error::{Error, ProtocolError, Result};
use crate::op::{Action, OperationContext, State, StepOutcome};

/// Backend tiers a state can target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Rc,
    Rs,
    Ns,
    Ms,
    Ds,
}

impl Tier {
    pub fn name(self) -> &'static str {
        match self {
            Tier::Rc => "rc server",
            Tier::Rs => "root server",
            Tier::Ns => "name server",
            Tier::Ms => "meta server",
            Tier::Ds => "data server",
        }
    }
}

/// Retry discipline for one tier call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Failures propagate immediately
    None,
    /// Recoverable failures re-target another endpoint of the same role
    /// without advancing the state, bounded by the context retry budget
    SameTier,
}

pub type BuildFn = fn(&mut OperationContext) -> Result<Frame>;
pub type ParseFn = fn(&mut OperationContext, &Frame) -> Result<StepOutcome>;

/// Descriptor the driver executes for one state
#[derive(Debug, Clone, Copy)]
pub struct TierOp {
    pub tier: Tier,
    pub retry: RetryPolicy,
    pub build: BuildFn,
    pub parse: ParseFn,
}

/// Transition table: pure function of the action and current state.
///
/// `*Start` and terminal states never reach this table; the driver resolves
/// route info for starts and finalizes terminals itself.
pub fn select_op(ctx: &OperationContext) -> Result<TierOp> {
    use State::*;
    let action = ctx.req.action;
    let op = match (action, ctx.state) {
        // meta-table fetch is shared by every custom-namespace flow
        (_, ReadGetMetaTable) | (_, WriteGetMetaTable) | (_, RemoveGetMetaTable)
        | (_, ActionGetMetaTable) => TierOp {
            tier: Tier::Rs,
            retry: RetryPolicy::None,
            build: rs::build_get_table,
            parse: rs::parse_get_table,
        },

        // read
        (Action::Read, ReadGetFragInfo) => {
            if ctx.req.large_file {
                // the meta segment lives on the DS tier for large files
                TierOp {
                    tier: Tier::Ds,
                    retry: RetryPolicy::SameTier,
                    build: ds::build_read_meta_segment,
                    parse: ds::parse_read_meta_segment,
                }
            } else {
                TierOp {
                    tier: Tier::Ms,
                    retry: RetryPolicy::None,
                    build: ms::build_read_meta,
                    parse: ms::parse_read_meta,
                }
            }
        }
        (Action::Read, ReadGetBlkInfo) => ns_block_info_op(),
        (Action::Read, ReadData) => TierOp {
            tier: Tier::Ds,
            retry: RetryPolicy::SameTier,
            build: ds::build_read,
            parse: ds::parse_read,
        },

        // write
        (Action::Write, WriteClusterIdMs) => TierOp {
            tier: Tier::Ms,
            retry: RetryPolicy::None,
            build: ms::build_cluster_id_probe,
            parse: ms::parse_cluster_id_probe,
        },
        (Action::Write, WriteClusterIdNs) => TierOp {
            tier: Tier::Ns,
            retry: RetryPolicy::SameTier,
            build: ns::build_get_cluster_id,
            parse: ns::parse_get_cluster_id,
        },
        (Action::Write, WriteGetGroupCount) | (Action::Remove, RemoveGetGroupCount) => TierOp {
            tier: Tier::Ns,
            retry: RetryPolicy::SameTier,
            build: ns::build_get_group_count,
            parse: ns::parse_get_group_count,
        },
        (Action::Write, WriteGetGroupSeq) | (Action::Remove, RemoveGetGroupSeq) => TierOp {
            tier: Tier::Ns,
            retry: RetryPolicy::SameTier,
            build: ns::build_get_group_seq,
            parse: ns::parse_get_group_seq,
        },
        (Action::Write, WriteGetBlkInfo) => ns_block_info_op(),
        (Action::Write, WriteStatDupFile) => TierOp {
            tier: Tier::Ds,
            retry: RetryPolicy::SameTier,
            build: ds::build_stat,
            parse: ds::parse_stat,
        },
        (Action::Write, WriteCreateFileName) => TierOp {
            tier: Tier::Ds,
            retry: RetryPolicy::SameTier,
            build: ds::build_create_filename,
            parse: ds::parse_create_filename,
        },
        (Action::Write, WriteData) => TierOp {
            tier: Tier::Ds,
            retry: RetryPolicy::None,
            build: ds::build_write,
            parse: ds::parse_write,
        },
        (Action::Write, WriteCloseFile) => TierOp {
            tier: Tier::Ds,
            retry: RetryPolicy::None,
            build: ds::build_close,
            parse: ds::parse_close,
        },
        (Action::Write, WriteMs) => TierOp {
            tier: Tier::Ms,
            retry: RetryPolicy::None,
            build: ms::build_write_meta,
            parse: ms::parse_write_meta,
        },
        (Action::Write, WriteDeleteData) => TierOp {
            tier: Tier::Ds,
            retry: RetryPolicy::None,
            build: ds::build_unlink,
            parse: ds::parse_rollback_unlink,
        },

        // remove
        (Action::Remove, RemoveGetFragInfo) => TierOp {
            tier: Tier::Ms,
            retry: RetryPolicy::None,
            build: ms::build_read_meta,
            parse: ms::parse_read_meta,
        },
        (Action::Remove, RemoveGetBlkInfo) => ns_block_info_op(),
        (Action::Remove, RemoveStatFile) => TierOp {
            tier: Tier::Ds,
            retry: RetryPolicy::SameTier,
            build: ds::build_stat,
            parse: ds::parse_stat,
        },
        (Action::Remove, RemoveReadMetaSegment) => TierOp {
            tier: Tier::Ds,
            retry: RetryPolicy::SameTier,
            build: ds::build_read,
            parse: ds::parse_read,
        },
        (Action::Remove, RemoveDeleteData) => TierOp {
            tier: Tier::Ds,
            retry: RetryPolicy::None,
            build: ds::build_unlink,
            parse: ds::parse_unlink,
        },
        (Action::Remove, RemoveNotifyMs) => TierOp {
            tier: Tier::Ms,
            retry: RetryPolicy::None,
            build: ms::build_action,
            parse: ms::parse_action,
        },

        // stat
        (Action::Stat, StatGetBlkInfo) => ns_block_info_op(),
        (Action::Stat, StatFile) => TierOp {
            tier: Tier::Ds,
            retry: RetryPolicy::SameTier,
            build: ds::build_stat,
            parse: ds::parse_stat,
        },

        // custom-namespace actions
        (Action::LsFile | Action::LsDir, ActionProcess) => TierOp {
            tier: Tier::Ms,
            retry: RetryPolicy::None,
            build: ms::build_ls,
            parse: ms::parse_ls,
        },
        (
            Action::CreateFile
            | Action::CreateDir
            | Action::MoveFile
            | Action::MoveDir
            | Action::RemoveDir,
            ActionProcess,
        ) => TierOp {
            tier: Tier::Ms,
            retry: RetryPolicy::None,
            build: ms::build_action,
            parse: ms::parse_action,
        },

        (action, state) => {
            return Err(Error::InvalidState(format!(
                "no tier op for {action:?} in {state:?}"
            )))
        }
    };
    Ok(op)
}

fn ns_block_info_op() -> TierOp {
    TierOp {
        tier: Tier::Ns,
        retry: RetryPolicy::SameTier,
        build: ns::build_get_block_info,
        parse: ns::parse_get_block_info,
    }
}

/// Reject a frame that is not `expected`, converting a tier status frame
/// into the corresponding error first. Every parser calls this before
/// touching the payload.
pub fn require(frame: &Frame, expected: MessageType) -> Result<()> {
    if frame.msg_type == MessageType::Status {
        let status = StatusMsg::decode(&frame.payload)?;
        if status.is_ok() {
            // a bare ok where data was expected
            if expected == MessageType::Status {
                return Ok(());
            }
            return Err(ProtocolError::UnexpectedType(MessageType::Status as u16).into());
        }
        return Err(Error::TierStatus {
            code: status.code,
            message: status.message,
        });
    }
    if frame.msg_type != expected {
        return Err(ProtocolError::UnexpectedType(frame.msg_type as u16).into());
    }
    Ok(())
}

/// Decode a response that must be a status frame; returns it with failures
/// mapped to [`Error::TierStatus`].
pub fn require_status_ok(frame: &Frame) -> Result<StatusMsg> {
    if frame.msg_type != MessageType::Status {
        return Err(ProtocolError::UnexpectedType(frame.msg_type as u16).into());
    }
    let status = StatusMsg::decode(&frame.payload)?;
    if !status.is_ok() {
        return Err(Error::TierStatus {
            code: status.code,
            message: status.message,
        });
    }
    Ok(status)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::RequestCtx;
    use assert_matches::assert_matches;
    use bytes::Bytes;

    fn ctx_in(action: Action, state: State) -> OperationContext {
        let mut ctx = OperationContext::new(
            RequestCtx {
                action,
                ..RequestCtx::default()
            },
            2,
        );
        ctx.state = state;
        ctx
    }

    #[test]
    fn test_dispatch_covers_read_path() {
        let ctx = ctx_in(Action::Read, State::ReadGetBlkInfo);
        let op = select_op(&ctx).unwrap();
        assert_eq!(op.tier, Tier::Ns);
        assert_eq!(op.retry, RetryPolicy::SameTier);

        let ctx = ctx_in(Action::Read, State::ReadData);
        assert_eq!(select_op(&ctx).unwrap().tier, Tier::Ds);
    }

    #[test]
    fn test_dispatch_large_read_uses_ds_meta_segment() {
        let mut ctx = ctx_in(Action::Read, State::ReadGetFragInfo);
        assert_eq!(select_op(&ctx).unwrap().tier, Tier::Ms);
        ctx.req.large_file = true;
        assert_eq!(select_op(&ctx).unwrap().tier, Tier::Ds);
    }

    #[test]
    fn test_dispatch_rejects_terminal_states() {
        let ctx = ctx_in(Action::Read, State::ReadDone);
        assert_matches!(select_op(&ctx), Err(Error::InvalidState(_)));
    }

    #[test]
    fn test_retry_policy_only_on_ns_and_ds() {
        let ms = select_op(&ctx_in(Action::LsDir, State::ActionProcess)).unwrap();
        assert_eq!(ms.retry, RetryPolicy::None);
        let ns = select_op(&ctx_in(Action::Stat, State::StatGetBlkInfo)).unwrap();
        assert_eq!(ns.retry, RetryPolicy::SameTier);
    }

    #[test]
    fn test_require_maps_status_failure() {
        let status = StatusMsg {
            code: -5003,
            message: "block not found".into(),
        };
        let frame = Frame::request(MessageType::Status, status.encode());
        let err = require(&frame, MessageType::RespReadData).unwrap_err();
        assert_matches!(err, Error::TierStatus { code: -5003, .. });
    }

    #[test]
    fn test_require_rejects_wrong_type() {
        let frame = Frame::request(MessageType::RespReadData, Bytes::new());
        assert_matches!(
            require(&frame, MessageType::RespFileInfo),
            Err(Error::Protocol(ProtocolError::UnexpectedType(8)))
        );
    }

    #[test]
    fn test_require_status_ok() {
        let ok = StatusMsg {
            code: 0,
            message: String::new(),
        };
        let frame = Frame::request(MessageType::Status, ok.encode());
        assert!(require_status_ok(&frame).is_ok());
    }
}
