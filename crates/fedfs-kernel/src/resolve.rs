//! Effective provider resolution.
//!
//! Resolution runs in three phases so no provider code executes under the
//! tree lock:
//!
//! 1. **plan** (read lock): return a live binding if there is one,
//!    otherwise snapshot the node's ancestry and pick the candidate root:
//!    the nearest node (the target included) with an assigned or dynamic
//!    provider id, or the default provider at the top root.
//! 2. **federate** (unlocked): instantiate the candidate, let federating
//!    providers hand the target over to other providers at its non-existing
//!    segments, then follow deep federation answers down towards the
//!    target. Each hand-off moves the root strictly deeper, so the chain
//!    ends after at most one step per path segment.
//! 3. **apply** (write lock): record the hand-offs as dynamic provider ids
//!    and bind the result, unless the tree changed structurally while the
//!    lock was released.

use std::sync::Arc;

use crate::error::{FsError, FsResult};
use crate::fs::FsCore;
use crate::path::ResourcePath;
use crate::provider::{Capabilities, ContentProvider, ResolvedProvider};
use crate::tree::NodeId;

struct Link {
    id: NodeId,
    path: ResourcePath,
    exists: bool,
    own_provider: Option<String>,
}

struct Plan {
    epoch: u64,
    chain: Vec<Link>,
    root: usize,
    provider_id: String,
}

/// A federation decision to record on `chain[index]`.
struct Hop {
    index: usize,
    resolved: ResolvedProvider,
}

struct Candidate {
    index: usize,
    id: String,
    provider: Arc<dyn ContentProvider>,
}

/// Resolve the effective provider of `node`.
pub(crate) fn resolve(core: &FsCore, node: NodeId) -> FsResult<ResolvedProvider> {
    let plan = match plan(core, node)? {
        Ok(bound) => return Ok(bound),
        Err(plan) => plan,
    };

    let mut hops = Vec::new();
    let outcome = federate(core, &plan, &mut hops);
    apply(core, &plan, &hops, outcome.as_ref().ok())?;
    outcome
}

/// `Ok(binding)` on the fast path, `Err(plan)` when work is needed.
fn plan(core: &FsCore, node: NodeId) -> FsResult<Result<ResolvedProvider, Plan>> {
    let tree = core.tree.read();
    if let Some(bound) = tree.binding(node) {
        return Ok(Ok(bound));
    }

    let missing = || match tree.path_of(node) {
        Some(path) => FsError::not_accessible(path),
        None => FsError::not_accessible(format!("<detached node {node}>")),
    };
    let ancestry = tree.ancestry(node).ok_or_else(missing)?;
    let full = tree.path_of(node).ok_or_else(missing)?;

    let mut chain = Vec::with_capacity(ancestry.len());
    for (depth, id) in ancestry.into_iter().enumerate() {
        let n = tree.node(id).ok_or_else(missing)?;
        chain.push(Link {
            id,
            path: full.prefix(depth + 1),
            exists: n.exists(),
            own_provider: n.own_provider_id().map(str::to_string),
        });
    }

    let (root, provider_id) = chain
        .iter()
        .enumerate()
        .rev()
        .find_map(|(i, link)| link.own_provider.clone().map(|id| (i, id)))
        .unwrap_or_else(|| (0, core.default_provider.clone()));

    Ok(Err(Plan {
        epoch: tree.epoch(),
        chain,
        root,
        provider_id,
    }))
}

fn federate(core: &FsCore, plan: &Plan, hops: &mut Vec<Hop>) -> FsResult<ResolvedProvider> {
    let target = plan.chain.len() - 1;
    let full = &plan.chain[target].path;

    let mut current = Candidate {
        index: plan.root,
        id: plan.provider_id.clone(),
        provider: core.registry.instantiate(
            &plan.provider_id,
            &plan.chain[plan.root].path,
            full,
        )?,
    };

    // Shallow federation: at each non-existing segment below the root the
    // candidate is asked about the full path; a hand-off roots at the segment.
    if !plan.chain[target].exists {
        for index in (current.index + 1)..=target {
            let link = &plan.chain[index];
            if link.exists {
                continue;
            }
            if !current.provider.capabilities().contains(Capabilities::FEDERATION) {
                break;
            }
            let Some(next) = current.provider.federated_provider_for_path(full)? else {
                continue;
            };
            if next == current.id {
                continue;
            }
            tracing::debug!(
                path = %full,
                root = %link.path,
                from = %current.id,
                to = %next,
                "federated hand-off"
            );
            current = hand_off(core, plan, hops, index, next)?;
        }
    }

    // Deep federation towards the target.
    while current.index < target
        && current
            .provider
            .capabilities()
            .contains(Capabilities::DEEP_FEDERATION)
    {
        let Some(info) = current.provider.federated_info_for_path(full)? else {
            break;
        };
        let remaining = target - current.index;
        if info.root_offset == 0 || info.root_offset > remaining {
            return Err(FsError::federation_violation(
                full,
                format!(
                    "provider {:?} answered root offset {} with {} segment(s) remaining",
                    current.id, info.root_offset, remaining
                ),
            ));
        }
        let index = target + 1 - info.root_offset;
        tracing::debug!(
            path = %full,
            root = %plan.chain[index].path,
            from = %current.id,
            to = %info.provider_id,
            "deep federated hand-off"
        );
        current = hand_off(core, plan, hops, index, info.provider_id)?;
    }

    Ok(ResolvedProvider::new(
        current.id,
        plan.chain[current.index].path.clone(),
        current.provider,
    ))
}

fn hand_off(
    core: &FsCore,
    plan: &Plan,
    hops: &mut Vec<Hop>,
    index: usize,
    provider_id: String,
) -> FsResult<Candidate> {
    let link = &plan.chain[index];
    let full = &plan.chain[plan.chain.len() - 1].path;
    let provider = core.registry.instantiate(&provider_id, &link.path, full)?;
    hops.push(Hop {
        index,
        resolved: ResolvedProvider::new(provider_id.clone(), link.path.clone(), Arc::clone(&provider)),
    });
    Ok(Candidate {
        index,
        id: provider_id,
        provider,
    })
}

/// Record hand-offs (even those made before a failure) and bind the result.
fn apply(
    core: &FsCore,
    plan: &Plan,
    hops: &[Hop],
    resolved: Option<&ResolvedProvider>,
) -> FsResult<()> {
    if hops.is_empty() && resolved.is_none() {
        return Ok(());
    }

    let mut tree = core.tree.write();
    let fresh = tree.epoch() == plan.epoch;
    let before = tree.epoch();

    for hop in hops {
        let link = &plan.chain[hop.index];
        tree.set_dynamic_provider(link.id, hop.resolved.id())?;
    }

    if fresh {
        for hop in hops {
            tree.set_binding(plan.chain[hop.index].id, hop.resolved.clone());
        }
        if let Some(resolved) = resolved {
            let target = plan.chain[plan.chain.len() - 1].id;
            tree.set_binding(target, resolved.clone());
        }
    }

    if tree.epoch() != before {
        core.persist(&mut tree)?;
    }
    Ok(())
}
