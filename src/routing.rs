use crate::backend::{BackendKind, KnowledgeSpaces};
use crate::error::{DispatchError, DispatchResult};
use crate::io_struct::ChatMode;

/// Domain tag of spaces that have no specialised graph.
pub const NORMAL_DOMAIN: &str = "Normal";

/// Picks the backend for a chat mode and the domain tag of its selected space.
pub fn route(mode: ChatMode, domain_tag: Option<&str>) -> BackendKind {
    match mode {
        ChatMode::Agent => BackendKind::Agent,
        ChatMode::Flow => BackendKind::Flow,
        _ => match domain_tag {
            Some(tag) if tag != NORMAL_DOMAIN => BackendKind::DomainGraph,
            _ => BackendKind::DirectModel,
        },
    }
}

/// Domain tag of the knowledge space a request selected.
///
/// Only knowledge chats have one. A space that does not exist is an error rather than a
/// silent fall-through to the plain model.
pub fn resolve_domain(
    mode: ChatMode,
    select_param: &str,
    spaces: &dyn KnowledgeSpaces,
) -> DispatchResult<Option<String>> {
    if mode != ChatMode::Knowledge {
        return Ok(None);
    }
    spaces
        .find_space(select_param)
        .map(|space| space.domain_type)
        .ok_or_else(|| DispatchError::NotFound(format!("knowledge space {}", select_param)))
}
