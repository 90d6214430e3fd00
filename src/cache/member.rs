use super::{CachedEntity, EntityCache};
use crate::model::Member;

/// Members cache the payload only; the email goes into the filter.
pub type MemberCache = EntityCache<Member>;

impl CachedEntity for Member {}
