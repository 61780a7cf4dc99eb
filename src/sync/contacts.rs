use uuid::Uuid;

use super::store::SyncStore;
use crate::error::SyncError;

/// Resolve a raw email address to an existing CRM contact, or `None`.
///
/// Precedence: exact case-insensitive match on the contact's email, then
/// any contact on the same domain (first match, arbitrary tie-break for
/// multi-contact domains). Read path only; contacts are never created
/// here, and unmatched messages are stored unlinked for manual linking.
pub async fn resolve_contact(
    store: &dyn SyncStore,
    address: &str,
) -> Result<Option<Uuid>, SyncError> {
    let address = address.trim().to_lowercase();
    if address.is_empty() {
        return Ok(None);
    }

    if let Some(id) = store.find_contact_by_email(&address).await? {
        return Ok(Some(id));
    }

    match address.split('@').nth(1) {
        Some(domain) if !domain.is_empty() => store.find_contact_by_domain(domain).await,
        _ => Ok(None),
    }
}
