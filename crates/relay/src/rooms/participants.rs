use formcollab_common::types::Identity;

/// Display colors, handed out in join order and reused cyclically.
pub const PALETTE: &[&str] = &[
    "#E5484D", "#0090FF", "#30A46C", "#F76B15", "#8E4EC6", "#12A594", "#D6409F", "#FFC53D",
];

pub fn color_for(join_index: usize) -> &'static str {
    PALETTE[join_index % PALETTE.len()]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub can_edit: bool,
    pub can_comment: bool,
}

/// Users may edit and comment. Guests may comment, and edit only when the
/// deployment allows it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessPolicy {
    pub guest_can_edit: bool,
}

impl AccessPolicy {
    pub fn new(guest_can_edit: bool) -> Self {
        Self { guest_can_edit }
    }

    pub fn permissions_for(&self, identity: &Identity) -> Permissions {
        match identity {
            Identity::User { .. } => Permissions { can_edit: true, can_comment: true },
            Identity::Guest { .. } => Permissions { can_edit: self.guest_can_edit, can_comment: true },
        }
    }
}
