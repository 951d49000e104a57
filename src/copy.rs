use crate::models::{Note, UserRef};
use chrono::Utc;
use std::collections::HashMap;
use uuid::Uuid;

/// Duplicates a note under a fresh UUID. Images and checklist items get new
/// UUIDs too, and child items are re-pointed at their re-keyed parents.
pub fn duplicate_note(source: &Note, creator: Option<UserRef>) -> Note {
    let now = Utc::now();
    let mut copy = source.clone();
    copy.uuid = Uuid::new_v4();
    copy.server_id = None;
    copy.is_pinned = false;
    copy.is_trash = false;
    copy.creator = creator.or_else(|| source.creator.clone());
    copy.collaborators = Vec::new();
    copy.created_at = now;
    copy.updated_at = now;
    copy.last_modified_by = None;

    for image in copy.images.iter_mut() {
        image.uuid = Uuid::new_v4();
    }

    let rekeyed = copy
        .checkboxes
        .iter()
        .map(|item| (item.uuid, Uuid::new_v4()))
        .collect::<HashMap<_, _>>();
    for item in copy.checkboxes.iter_mut() {
        if let Some(fresh) = rekeyed.get(&item.uuid) {
            item.uuid = *fresh;
        }
        item.parent = item.parent.and_then(|parent| rekeyed.get(&parent).copied());
    }

    copy
}

#[cfg(test)]
mod tests {
    use super::duplicate_note;
    use crate::models::{Checkbox, Note, NoteImage};
    use uuid::Uuid;

    #[test]
    fn copy_rekeys_sub_entities_and_keeps_links() {
        let mut note = Note::new(Uuid::new_v4(), None);
        note.server_id = Some("server-1".to_string());
        note.is_pinned = true;
        note.images = vec![NoteImage {
            uuid: Uuid::new_v4(),
            url: "https://img.example/a.png".to_string(),
        }];
        let parent = Checkbox::new("parent", None);
        let child = Checkbox::new("child", Some(parent.uuid));
        note.checkboxes = vec![parent.clone(), child.clone()];

        let copy = duplicate_note(&note, None);
        assert_ne!(copy.uuid, note.uuid);
        assert!(copy.server_id.is_none());
        assert!(!copy.is_pinned);
        assert_ne!(copy.images[0].uuid, note.images[0].uuid);
        assert_eq!(copy.images[0].url, note.images[0].url);
        assert_ne!(copy.checkboxes[0].uuid, parent.uuid);
        assert_ne!(copy.checkboxes[1].uuid, child.uuid);
        assert_eq!(copy.checkboxes[1].parent, Some(copy.checkboxes[0].uuid));
        assert_eq!(copy.checkboxes[0].parent, None);
    }
}
