//! Binding resolution
//!
//! Given a freshly decoded parent header, the resolver walks the parent
//! protocol's declared bindings to decide which protocol follows it in the
//! frame. All primary bindings are tried in declaration order; heuristic
//! bindings are consulted only if no primary binding matched. The first
//! match wins.

use crate::buffer::ByteView;
use crate::core::packet::{HeaderInstance, PacketState};
use crate::protocols::{Binding, BindingKind, ProtocolDescriptor, ProtocolId, ProtocolRegistry};

/// Evaluates candidate next-protocol bindings for a decoded header
pub struct BindingResolver;

impl BindingResolver {
    /// Resolve the protocol following the header at `parent_index`, if any
    ///
    /// Returns `None` when no binding matches; the scanner then treats the
    /// remainder of the frame as untyped payload.
    pub fn resolve(
        registry: &ProtocolRegistry,
        view: &ByteView,
        state: &PacketState,
        parent_index: usize,
    ) -> Option<ProtocolId> {
        let parent: &HeaderInstance = state.headers().get(parent_index)?;
        let descriptor: &ProtocolDescriptor = registry.lookup(parent.protocol)?;

        Self::matching_pass(descriptor, view, state, parent, BindingKind::Primary).or_else(
            || Self::matching_pass(descriptor, view, state, parent, BindingKind::Heuristic),
        )
    }

    fn matching_pass(
        descriptor: &ProtocolDescriptor,
        view: &ByteView,
        state: &PacketState,
        parent: &HeaderInstance,
        kind: BindingKind,
    ) -> Option<ProtocolId> {
        for binding in descriptor
            .bindings
            .iter()
            .filter(|b: &&Binding| b.kind == kind)
        {
            // Dependency pre-filter: skip the predicate outright when a
            // prerequisite header is not present in the frame
            if !binding.requires.iter().all(|&id| state.has_header(id)) {
                continue;
            }

            // Cheap tag compare before the full predicate
            if let Some(guard) = &binding.guard {
                if !guard.matches(view, parent) {
                    continue;
                }
            }

            if (binding.predicate)(view, parent) {
                return Some(binding.target);
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ByteOrder;
    use crate::protocols::{ids, BindingGuard, HeaderLength};

    fn yes(_: &ByteView, _: &HeaderInstance) -> bool {
        true
    }

    fn no(_: &ByteView, _: &HeaderInstance) -> bool {
        false
    }

    fn registry_with(bindings: Vec<Binding>) -> ProtocolRegistry {
        let mut registry: ProtocolRegistry = ProtocolRegistry::new();
        registry
            .register(ProtocolDescriptor {
                id: ids::ETHERNET,
                name: "parent",
                length: HeaderLength::Fixed(4),
                sub_headers: None,
                fragmentation: None,
                bindings,
            })
            .unwrap();
        registry
    }

    fn state_with_parent() -> PacketState {
        let mut state: PacketState = PacketState::new(0);
        state.push(HeaderInstance::top_level(ids::ETHERNET, 0, 4));
        state
    }

    #[test]
    fn test_primary_wins_over_heuristic_regardless_of_order() {
        let registry: ProtocolRegistry = registry_with(vec![
            Binding {
                target: ids::HTTP,
                kind: BindingKind::Heuristic,
                guard: None,
                requires: &[],
                predicate: yes,
            },
            Binding {
                target: ids::IP4,
                kind: BindingKind::Primary,
                guard: None,
                requires: &[],
                predicate: yes,
            },
        ]);
        let view: ByteView = ByteView::new(vec![0; 8]);
        let state: PacketState = state_with_parent();

        let next = BindingResolver::resolve(&registry, &view, &state, 0);
        assert_eq!(next, Some(ids::IP4));
    }

    #[test]
    fn test_heuristic_used_when_no_primary_matches() {
        let registry: ProtocolRegistry = registry_with(vec![
            Binding {
                target: ids::IP4,
                kind: BindingKind::Primary,
                guard: None,
                requires: &[],
                predicate: no,
            },
            Binding {
                target: ids::HTTP,
                kind: BindingKind::Heuristic,
                guard: None,
                requires: &[],
                predicate: yes,
            },
        ]);
        let view: ByteView = ByteView::new(vec![0; 8]);
        let state: PacketState = state_with_parent();

        let next = BindingResolver::resolve(&registry, &view, &state, 0);
        assert_eq!(next, Some(ids::HTTP));
    }

    #[test]
    fn test_guard_short_circuits_predicate() {
        // Guard mismatches, so even an always-true predicate never fires
        let registry: ProtocolRegistry = registry_with(vec![Binding {
            target: ids::IP4,
            kind: BindingKind::Primary,
            guard: Some(BindingGuard::U16At {
                offset: 0,
                value: 0x0800,
            }),
            requires: &[],
            predicate: yes,
        }]);
        let view: ByteView =
            ByteView::new(vec![0x86, 0xDD, 0, 0]).with_byte_order(ByteOrder::BigEndian);
        let state: PacketState = state_with_parent();

        assert_eq!(BindingResolver::resolve(&registry, &view, &state, 0), None);
    }

    #[test]
    fn test_prerequisite_prefilter() {
        let registry: ProtocolRegistry = registry_with(vec![Binding {
            target: ids::L2TP,
            kind: BindingKind::Primary,
            guard: None,
            requires: &[ids::IP6],
            predicate: yes,
        }]);
        let view: ByteView = ByteView::new(vec![0; 8]);

        let state: PacketState = state_with_parent();
        assert_eq!(BindingResolver::resolve(&registry, &view, &state, 0), None);

        let mut state: PacketState = state_with_parent();
        state.push(HeaderInstance::top_level(ids::IP6, 4, 0));
        assert_eq!(
            BindingResolver::resolve(&registry, &view, &state, 0),
            Some(ids::L2TP)
        );
    }
}
