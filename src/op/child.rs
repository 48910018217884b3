//! Per-segment child operations
//!
//! Once an operation holds more than one segment, each segment runs in its
//! own child context so reads and writes pipeline across independent DS
//! connections. A child shares the parent's route snapshot and request data
//! but owns its segment, buffers and peer rotation outright; children never
//! spawn children. The parent aggregates by segment index, not completion
//! order, and fails whole on the first failed child.

use futures::future::join_all;
use tracing::debug;

use crate::error::{Error, Result};
use crate::op::driver::Driver;
use crate::op::{OperationContext, State};

/// Run every segment of `ctx` as a child operation starting at the current
/// state, then advance the parent past the fanned-out phase.
pub(crate) async fn fan_out(driver: &Driver, ctx: &mut OperationContext) -> Result<()> {
    let start_state = ctx.state;
    debug!(
        segments = ctx.segments.len(),
        state = ?start_state,
        "fanning out per-segment children"
    );

    let children: Vec<OperationContext> = ctx
        .segments
        .iter()
        .enumerate()
        .map(|(index, segment)| {
            let mut child = OperationContext::new(ctx.req.clone(), ctx.retry_budget);
            child.route = ctx.route.clone();
            child.cluster_id = ctx.cluster_id;
            child.fsname = ctx.fsname.clone();
            child.ns_addr = ctx.ns_addr;
            child.segments = vec![segment.clone()];
            child.state = start_state;
            child.is_child = true;
            child.is_first_segment = false;
            // only the first child asks for the metadata tail
            child.want_stat_tail = ctx.want_stat_tail && index == 0 && ctx.file_stat.is_none();
            child
        })
        .collect();

    let results = join_all(
        children
            .into_iter()
            .map(|child| async move { run_child(driver, child).await }),
    )
    .await;

    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(child) => merge_child(ctx, index, child),
            Err(err) => {
                return Err(Error::SegmentFailed {
                    failed_segment_index: index,
                    source: Box::new(err),
                })
            }
        }
    }
    ctx.segment_index = ctx.segments.len();

    ctx.state = match start_state {
        State::ReadData => State::ReadDone,
        _ => {
            if ctx.req.file_path.is_empty() {
                State::WriteDone
            } else {
                State::WriteMs
            }
        }
    };
    Ok(())
}

/// Drive a child until its DS-side work is complete. A child stops at the
/// parent-owned meta-commit state rather than crossing tiers.
async fn run_child(driver: &Driver, mut ctx: OperationContext) -> Result<OperationContext> {
    loop {
        if ctx.state.is_terminal() || ctx.state == State::WriteMs {
            return Ok(ctx);
        }
        driver.step(&mut ctx).await?;
    }
}

/// Fold a finished child back into the parent at its segment index.
fn merge_child(parent: &mut OperationContext, index: usize, child: OperationContext) {
    if let Some(slot) = parent.segments.get_mut(index) {
        if let Some(seg) = child.segments.into_iter().next() {
            *slot = seg;
        }
    }
    // read data aggregates in segment order because children are visited in
    // segment order, regardless of completion order
    parent.out_data.extend(child.out_data);
    if parent.file_stat.is_none() {
        parent.file_stat = child.file_stat;
    }
    if parent.fsname.is_none() {
        parent.fsname = child.fsname;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{Action, RequestCtx, Segment, SegmentInfo};
    use bytes::Bytes;

    fn parent_with_segments(n: usize) -> OperationContext {
        let mut ctx = OperationContext::new(
            RequestCtx {
                action: Action::Read,
                length: (n * 100) as u64,
                ..RequestCtx::default()
            },
            2,
        );
        ctx.state = State::ReadData;
        ctx.segments = (0..n)
            .map(|i| Segment {
                info: SegmentInfo {
                    block_id: i as u32,
                    file_id: 1,
                    offset: (i * 100) as i64,
                    size: 100,
                    crc: 0,
                },
                oper_size: 100,
                ..Segment::default()
            })
            .collect();
        ctx
    }

    #[test]
    fn test_merge_preserves_segment_order() {
        let mut parent = parent_with_segments(2);

        let mut second = OperationContext::new(parent.req.clone(), 2);
        second.segments = vec![parent.segments[1].clone()];
        second.out_data = vec![Bytes::from_static(b"second")];

        let mut first = OperationContext::new(parent.req.clone(), 2);
        first.segments = vec![parent.segments[0].clone()];
        first.out_data = vec![Bytes::from_static(b"first")];

        // merged in index order even though "second" finished first
        merge_child(&mut parent, 0, first);
        merge_child(&mut parent, 1, second);
        assert_eq!(&parent.out_data[0][..], b"first");
        assert_eq!(&parent.out_data[1][..], b"second");
    }

    #[test]
    fn test_children_never_nest() {
        let parent = parent_with_segments(3);
        let child = {
            let mut c = OperationContext::new(parent.req.clone(), 2);
            c.is_child = true;
            c.segments = vec![parent.segments[0].clone()];
            c
        };
        // a child always carries exactly one segment, so the fan-out guard
        // (len > 1 && !is_child) can never fire inside it
        assert_eq!(child.segments.len(), 1);
        assert!(child.is_child);
    }
}
