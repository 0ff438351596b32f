// Hard bounds on caller input. Checked before any lock or store access.

pub const MAX_RESOURCE_ID_LEN: usize = 128;
pub const MAX_REQUESTER_ID_LEN: usize = 128;

/// Largest quantity a single reservation may request.
pub const MAX_QUANTITY: u32 = 10_000;
