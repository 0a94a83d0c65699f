//! Deterministic file naming for discovered images.
//!
//! Standalone images take one numbered slot each. A run of strictly
//! consecutive carousel members with the same group key shares a single
//! slot and is numbered `{slot}.{member}(CAROUSEL)`.

use crate::models::ImageReference;

/// An image paired with the file name it will be saved under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedImage {
    pub reference: ImageReference,
    pub file_name: String,
}

/// Name `images` with `prefix`, in `discovery_order`.
///
/// Input order is irrelevant; the result is sorted by discovery order.
pub fn assign_names(prefix: &str, images: &[ImageReference]) -> Vec<NamedImage> {
    let mut ordered: Vec<&ImageReference> = images.iter().collect();
    ordered.sort_by_key(|r| r.discovery_order);

    let mut named = Vec::with_capacity(ordered.len());
    let mut slot = 1usize;
    let mut i = 0usize;

    while i < ordered.len() {
        let current = ordered[i];
        let group = current
            .is_carousel_member
            .then_some(current.carousel_group_key.as_deref())
            .flatten();

        let Some(key) = group else {
            named.push(NamedImage {
                reference: current.clone(),
                file_name: format!("{prefix}{slot}.jpg"),
            });
            slot += 1;
            i += 1;
            continue;
        };

        let run_len = ordered[i..]
            .iter()
            .take_while(|r| r.is_carousel_member && r.carousel_group_key.as_deref() == Some(key))
            .count();

        for (member, reference) in ordered[i..i + run_len].iter().enumerate() {
            named.push(NamedImage {
                reference: (*reference).clone(),
                file_name: format!("{prefix}{slot}.{}(CAROUSEL).jpg", member + 1),
            });
        }
        slot += 1;
        i += run_len;
    }

    named
}
