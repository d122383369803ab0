/// Work that needs to be done by the downstream service.
///
/// The id is the only payload. Different clients may request the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Request {
    pub id: u64,
}

impl Request {
    pub const fn new(id: u64) -> Self {
        Self { id }
    }
}
