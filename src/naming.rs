//! Accessory name resolution.
//!
//! The Miniserver taxonomy (rooms × categories × sub-controls × virtual
//! moods/zones) carries human-entered names that are neither unique nor
//! HomeKit-legal. This module turns them into display names that are:
//!
//! - **Legal**: letters, digits, whitespace, apostrophes only, at most
//!   [`MAX_NAME_LEN`] characters.
//! - **Unique**: no two top-level accessories share a name within one
//!   mapping session.
//! - **Stable**: once a control UUID has been given a name, every later
//!   lookup in the same session returns that exact string, so accessories
//!   are not torn down and re-created over argument drift.
//!
//! ## Session lifecycle
//!
//! ```text
//! begin_session  -> issued set and identity map cleared
//! resolve(...)   -> name issued (or replayed for a known UUID)
//! begin_session  -> next full mapping pass starts fresh
//! ```
//!
//! Parenthesized text is unwrapped: `"Living Room (MH06)"` keeps `MH06`.
//! The inner token is often what distinguishes sibling devices, so keeping
//! it avoids falling back to numeric suffixes.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// HomeKit display-name limit in characters.
pub const MAX_NAME_LEN: usize = 64;

/// Name used when sanitization leaves nothing usable.
const FALLBACK_NAME: &str = "Accessory";

#[derive(Default)]
struct SessionMaps {
    /// Names already issued to top-level accessories this session.
    issued: HashSet<String>,
    /// UUID -> resolved name, for session-stable lookups.
    by_key: HashMap<String, String>,
}

/// Session-scoped unique-name generator and identity map.
///
/// One instance lives for the lifetime of the platform; each full
/// config-reload mapping pass calls [`begin_session`](Self::begin_session)
/// before resolving any names, which discards state from the previous pass
/// so departed devices do not pin their old names.
pub struct NameResolver {
    maps: Mutex<SessionMaps>,
}

impl NameResolver {
    pub fn new() -> Self {
        Self {
            maps: Mutex::new(SessionMaps::default()),
        }
    }

    /// Start a new mapping pass, clearing the issued set and identity map.
    pub fn begin_session(&self) {
        let mut maps = self.maps.lock();
        let dropped = maps.by_key.len();
        maps.issued.clear();
        maps.by_key.clear();
        tracing::debug!(dropped, "naming session reset");
    }

    /// Resolve a display name for a control.
    ///
    /// - `room`: room name as reported by the controller (may be empty).
    /// - `base_candidate`: the control's own name.
    /// - `identity_key`: stable UUID of the control; repeated calls with
    ///   the same key return the previously issued name unconditionally.
    /// - `is_sub_item`: sub-controls get the room prefix but are never
    ///   deduplicated — siblings may legitimately share display text.
    pub fn resolve(
        &self,
        room: &str,
        base_candidate: &str,
        identity_key: &str,
        is_sub_item: bool,
    ) -> String {
        let mut maps = self.maps.lock();

        if let Some(existing) = maps.by_key.get(identity_key) {
            return existing.clone();
        }

        let room = sanitize(room);
        let mut name = sanitize(base_candidate);
        if name.is_empty() {
            name = if room.is_empty() {
                FALLBACK_NAME.to_string()
            } else {
                room.clone()
            };
        }

        if !room.is_empty() && !has_word_prefix(&name, &room) {
            name = cap_len(&format!("{room} {name}"));
        }

        if is_sub_item {
            maps.by_key.insert(identity_key.to_string(), name.clone());
            return name;
        }

        let unique = dedup(&name, &maps.issued);
        if unique != name {
            tracing::debug!(base = %name, resolved = %unique, "name collision disambiguated");
        }
        maps.issued.insert(unique.clone());
        maps.by_key.insert(identity_key.to_string(), unique.clone());
        unique
    }

    /// Name previously issued for a UUID in this session, if any.
    pub fn resolved(&self, identity_key: &str) -> Option<String> {
        self.maps.lock().by_key.get(identity_key).cloned()
    }

    /// Number of unique top-level names issued this session.
    pub fn issued_count(&self) -> usize {
        self.maps.lock().issued.len()
    }
}

impl Default for NameResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Sanitize a raw controller-supplied name.
///
/// Parentheses are unwrapped (inner text kept), every character outside
/// {letters, digits, whitespace, apostrophe} is removed, whitespace runs
/// collapse to a single space, and the result is trimmed and capped to
/// [`MAX_NAME_LEN`].
fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_space = true; // leading whitespace is dropped

    for c in raw.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else if c.is_alphanumeric() || c == '\'' {
            out.push(c);
            last_was_space = false;
        }
        // '(' , ')' and all other punctuation are dropped entirely;
        // dropping the parens is what unwraps their content.
    }

    while out.ends_with(' ') {
        out.pop();
    }
    cap_len(&out)
}

/// Truncate to [`MAX_NAME_LEN`] characters without leaving a dangling space.
fn cap_len(name: &str) -> String {
    let mut capped: String = name.chars().take(MAX_NAME_LEN).collect();
    while capped.ends_with(' ') {
        capped.pop();
    }
    capped
}

/// Whether `name` already starts with `room` as a whole word,
/// case-insensitively.
///
/// `"Living Room Light"` has the prefix `"Living Room"`; `"Living Roomy"`
/// does not.
fn has_word_prefix(name: &str, room: &str) -> bool {
    let name_lower = name.to_lowercase();
    let room_lower = room.to_lowercase();
    name_lower == room_lower || name_lower.starts_with(&format!("{room_lower} "))
}

/// Append the smallest ` N` suffix (N >= 2) making `name` unused.
///
/// The first claimant of a base name always keeps the undecorated form.
fn dedup(name: &str, issued: &HashSet<String>) -> String {
    if !issued.contains(name) {
        return name.to_string();
    }
    let mut n = 2u32;
    loop {
        let suffix = format!(" {n}");
        let room_for_stem = MAX_NAME_LEN.saturating_sub(suffix.chars().count());
        let stem: String = name.chars().take(room_for_stem).collect();
        let candidate = format!("{}{suffix}", stem.trim_end());
        if !issued.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> NameResolver {
        NameResolver::new()
    }

    // --- Sanitization ---

    #[test]
    fn sanitize_unwraps_parentheses() {
        assert_eq!(sanitize("Living Room (MH06)"), "Living Room MH06");
    }

    #[test]
    fn sanitize_strips_illegal_punctuation() {
        assert_eq!(sanitize("Küche: Licht/2"), "Küche Licht2");
    }

    #[test]
    fn sanitize_keeps_apostrophe() {
        assert_eq!(sanitize("Tom's Desk"), "Tom's Desk");
    }

    #[test]
    fn sanitize_collapses_whitespace() {
        assert_eq!(sanitize("  Hall \t Light  "), "Hall Light");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "a".repeat(100);
        assert_eq!(sanitize(&long).chars().count(), MAX_NAME_LEN);
    }

    // --- Room prefixing ---

    #[test]
    fn room_prefix_added() {
        let r = resolver();
        assert_eq!(r.resolve("Kitchen", "Light", "uuid-1", false), "Kitchen Light");
    }

    #[test]
    fn room_prefix_not_duplicated() {
        let r = resolver();
        assert_eq!(
            r.resolve("Living Room", "Living Room (MH06)", "uuid-1", false),
            "Living Room MH06"
        );
    }

    #[test]
    fn room_prefix_whole_word_only() {
        let r = resolver();
        // "Living Roomy" does not count as already-prefixed with "Living Room".
        assert_eq!(
            r.resolve("Living Room", "Living Roomy", "uuid-1", false),
            "Living Room Living Roomy"
        );
    }

    #[test]
    fn room_prefix_case_insensitive() {
        let r = resolver();
        assert_eq!(
            r.resolve("Kitchen", "kitchen light", "uuid-1", false),
            "kitchen light"
        );
    }

    #[test]
    fn empty_base_falls_back_to_room() {
        let r = resolver();
        assert_eq!(r.resolve("Kitchen", "!!!", "uuid-1", false), "Kitchen");
    }

    #[test]
    fn empty_everything_falls_back() {
        let r = resolver();
        assert_eq!(r.resolve("", "", "uuid-1", false), FALLBACK_NAME);
    }

    // --- Uniqueness ---

    #[test]
    fn collisions_get_numeric_suffixes_in_order() {
        let r = resolver();
        assert_eq!(r.resolve("Hall", "Light", "a", false), "Hall Light");
        assert_eq!(r.resolve("Hall", "Light", "b", false), "Hall Light 2");
        assert_eq!(r.resolve("Hall", "Light", "c", false), "Hall Light 3");
    }

    #[test]
    fn sub_items_may_collide() {
        let r = resolver();
        assert_eq!(r.resolve("Hall", "Mood", "a", true), "Hall Mood");
        assert_eq!(r.resolve("Hall", "Mood", "b", true), "Hall Mood");
    }

    #[test]
    fn suffix_respects_length_cap() {
        let r = resolver();
        let long = "x".repeat(70);
        let first = r.resolve("", &long, "a", false);
        let second = r.resolve("", &long, "b", false);
        assert_ne!(first, second);
        assert!(second.chars().count() <= MAX_NAME_LEN);
        assert!(second.ends_with(" 2"));
    }

    // --- Stability ---

    #[test]
    fn repeated_resolve_is_stable_despite_argument_drift() {
        let r = resolver();
        let first = r.resolve("Kitchen", "Light", "uuid-1", false);
        // Later calls with different room/base still replay the first name.
        let second = r.resolve("Renamed Room", "Other Name", "uuid-1", false);
        assert_eq!(first, second);
    }

    #[test]
    fn resolved_lookup() {
        let r = resolver();
        assert!(r.resolved("uuid-1").is_none());
        let name = r.resolve("Kitchen", "Light", "uuid-1", false);
        assert_eq!(r.resolved("uuid-1").as_deref(), Some(name.as_str()));
    }

    // --- Session lifecycle ---

    #[test]
    fn begin_session_clears_state() {
        let r = resolver();
        r.resolve("Hall", "Light", "a", false);
        r.resolve("Hall", "Light", "b", false);
        assert_eq!(r.issued_count(), 2);

        r.begin_session();
        assert_eq!(r.issued_count(), 0);
        assert!(r.resolved("a").is_none());
        // After reset, the undecorated form is available again.
        assert_eq!(r.resolve("Hall", "Light", "b", false), "Hall Light");
    }
}
