use haat_contracts::Role;

use crate::model::{CatalogItem, Conversation, Principal};

/// Only a buyer and a farmer may converse.
pub fn can_converse(a: Role, b: Role) -> bool {
    matches!((a, b), (Role::Buyer, Role::Farmer) | (Role::Farmer, Role::Buyer))
}

pub fn can_pair(a: &Principal, b: &Principal) -> bool {
    a.id != b.id && can_converse(a.role, b.role)
}

/// A catalog item may tag a conversation when either party owns it.
pub fn can_attach_context(principal: &str, item: &CatalogItem, counterpart: &str) -> bool {
    item.owner == principal || item.owner == counterpart
}

pub fn is_participant(conversation: &Conversation, principal: &str) -> bool {
    conversation.has_participant(principal)
}

pub fn is_eligible(principal: &Principal) -> bool {
    principal.active && !principal.blocked
}

pub fn may_use_chat(role: Role) -> bool {
    matches!(role, Role::Buyer | Role::Farmer)
}

/// The role a principal is allowed to reach.
pub fn counterpart_role(role: Role) -> Option<Role> {
    match role {
        Role::Buyer => Some(Role::Farmer),
        Role::Farmer => Some(Role::Buyer),
        Role::Admin => None,
    }
}
