//! In-process model of a rendered feed page.
//!
//! Elements live in an arena and are addressed by [`ElementHandle`]s. A handle
//! does not own its element: once the page removes the element the handle goes
//! stale and every lookup through it returns `None`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Set on a post as soon as it is seen; hides it.
pub const MARK_ATTR: &str = "data-image-muter";
/// Set once the post has a decision.
pub const PROCESSED_ATTR: &str = "data-processed";
/// `"true"` keeps a processed post hidden, `"false"` reveals it.
pub const MUTED_ATTR: &str = "data-muted";

pub type SharedPage = Arc<Mutex<Page>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone)]
pub struct Element {
    pub tag: String,
    pub attrs: BTreeMap<String, String>,
    pub text: String,
    parent: Option<ElementHandle>,
    children: Vec<ElementHandle>,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn parent(&self) -> Option<ElementHandle> {
        self.parent
    }

    pub fn children(&self) -> &[ElementHandle] {
        &self.children
    }
}

/// Serializable description of a subtree to insert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementSpec {
    pub tag: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub children: Vec<ElementSpec>,
}

impl ElementSpec {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn child(mut self, child: ElementSpec) -> Self {
        self.children.push(child);
        self
    }
}

/// A batch of subtrees that were attached to the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub added: Vec<ElementHandle>,
}

struct Slot {
    generation: u32,
    element: Option<Element>,
}

pub struct Page {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: ElementHandle,
    observer: Option<mpsc::UnboundedSender<MutationRecord>>,
    /// Insertions the observer has been told about but not yet handled.
    unhandled: HashSet<ElementHandle>,
}

impl Page {
    pub fn new() -> Self {
        let mut page = Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: ElementHandle {
                index: 0,
                generation: 0,
            },
            observer: None,
            unhandled: HashSet::new(),
        };
        page.root = page.alloc(Element {
            tag: "body".to_string(),
            attrs: BTreeMap::new(),
            text: String::new(),
            parent: None,
            children: Vec::new(),
        });
        page
    }

    pub fn into_shared(self) -> SharedPage {
        Arc::new(Mutex::new(self))
    }

    pub fn root(&self) -> ElementHandle {
        self.root
    }

    pub fn get(&self, handle: ElementHandle) -> Option<&Element> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.element.as_ref())
    }

    fn get_mut(&mut self, handle: ElementHandle) -> Option<&mut Element> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.element.as_mut())
    }

    pub fn contains(&self, handle: ElementHandle) -> bool {
        self.get(handle).is_some()
    }

    fn alloc(&mut self, element: Element) -> ElementHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.element = Some(element);
            return ElementHandle {
                index,
                generation: slot.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            element: Some(element),
        });
        ElementHandle {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    fn build(&mut self, parent: ElementHandle, spec: ElementSpec) -> ElementHandle {
        let handle = self.alloc(Element {
            tag: spec.tag,
            attrs: spec.attrs,
            text: spec.text,
            parent: Some(parent),
            children: Vec::new(),
        });
        for child in spec.children {
            let child_handle = self.build(handle, child);
            if let Some(element) = self.get_mut(handle) {
                element.children.push(child_handle);
            }
        }
        handle
    }

    /// Attach `spec` as the last child of `parent` and notify the observer.
    /// Returns `None` if `parent` is stale.
    pub fn append(&mut self, parent: ElementHandle, spec: ElementSpec) -> Option<ElementHandle> {
        if !self.contains(parent) {
            return None;
        }
        let handle = self.build(parent, spec);
        self.get_mut(parent)?.children.push(handle);

        if let Some(observer) = &self.observer {
            let record = MutationRecord {
                added: vec![handle],
            };
            if observer.send(record).is_err() {
                self.observer = None;
            } else {
                self.unhandled.insert(handle);
            }
        }
        Some(handle)
    }

    /// Detach and free a subtree. Every handle into it goes stale.
    pub fn remove(&mut self, handle: ElementHandle) -> bool {
        if handle == self.root {
            return false;
        }
        let Some(parent) = self.get(handle).map(|e| e.parent) else {
            return false;
        };
        if let Some(parent) = parent.and_then(|p| self.get_mut(p)) {
            parent.children.retain(|c| *c != handle);
        }

        let mut stack = vec![handle];
        while let Some(current) = stack.pop() {
            self.unhandled.remove(&current);
            let slot = &mut self.slots[current.index as usize];
            if let Some(element) = slot.element.take() {
                stack.extend(element.children);
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(current.index);
            }
        }
        true
    }

    pub fn attr(&self, handle: ElementHandle, name: &str) -> Option<&str> {
        self.get(handle)?.attr(name)
    }

    pub fn set_attr(&mut self, handle: ElementHandle, name: &str, value: &str) -> bool {
        match self.get_mut(handle) {
            Some(element) => {
                element.attrs.insert(name.to_string(), value.to_string());
                true
            }
            None => false,
        }
    }

    pub fn remove_attr(&mut self, handle: ElementHandle, name: &str) -> bool {
        match self.get_mut(handle) {
            Some(element) => element.attrs.remove(name).is_some(),
            None => false,
        }
    }

    /// Descendants of `handle` (not itself) satisfying `pred`, in document order.
    pub fn descendants_where<F>(&self, handle: ElementHandle, pred: F) -> Vec<ElementHandle>
    where
        F: Fn(&Element) -> bool,
    {
        let mut found = Vec::new();
        let Some(element) = self.get(handle) else {
            return found;
        };
        let mut stack: Vec<ElementHandle> = element.children.iter().rev().copied().collect();
        while let Some(current) = stack.pop() {
            if let Some(element) = self.get(current) {
                if pred(element) {
                    found.push(current);
                }
                stack.extend(element.children.iter().rev().copied());
            }
        }
        found
    }

    pub fn query_all(&self, handle: ElementHandle, tag: &str) -> Vec<ElementHandle> {
        self.descendants_where(handle, |e| e.tag.eq_ignore_ascii_case(tag))
    }

    pub fn query_first(&self, handle: ElementHandle, tag: &str) -> Option<ElementHandle> {
        self.query_all(handle, tag).into_iter().next()
    }

    /// Nearest inclusive ancestor with the given tag.
    pub fn closest(&self, handle: ElementHandle, tag: &str) -> Option<ElementHandle> {
        let mut current = Some(handle);
        while let Some(h) = current {
            let element = self.get(h)?;
            if element.tag.eq_ignore_ascii_case(tag) {
                return Some(h);
            }
            current = element.parent;
        }
        None
    }

    pub fn text_content(&self, handle: ElementHandle) -> String {
        let mut out = String::new();
        if let Some(element) = self.get(handle) {
            out.push_str(&element.text);
            for child in &element.children {
                out.push_str(&self.text_content(*child));
            }
        }
        out
    }

    pub fn observe(&mut self, sender: mpsc::UnboundedSender<MutationRecord>) {
        self.observer = Some(sender);
    }

    pub fn disconnect(&mut self) {
        self.observer = None;
        self.unhandled.clear();
    }

    /// The observer has dealt with these insertions; they render normally
    /// from now on.
    pub fn acknowledge(&mut self, handles: &[ElementHandle]) {
        for handle in handles {
            self.unhandled.remove(handle);
        }
    }

    pub fn is_observed(&self) -> bool {
        self.observer.is_some()
    }

    /// Whether the element would be rendered, given the marker attributes.
    /// Stale handles are never visible, and neither is anything inside an
    /// insertion the observer has not handled yet.
    pub fn is_visible(&self, handle: ElementHandle) -> bool {
        let Some(element) = self.get(handle) else {
            return false;
        };
        let mut current = Some(handle);
        while let Some(h) = current {
            if self.unhandled.contains(&h) {
                return false;
            }
            current = self.get(h).and_then(|e| e.parent);
        }
        if element.attr(MARK_ATTR).is_none() {
            return true;
        }
        element.attr(PROCESSED_ATTR) == Some("true") && element.attr(MUTED_ATTR) == Some("false")
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(id: &str) -> ElementSpec {
        ElementSpec::new("article")
            .attr("id", id)
            .child(ElementSpec::new("span").text("hello "))
            .child(ElementSpec::new("img").attr("src", format!("https://x/{id}.png")))
            .child(ElementSpec::new("span").text("world"))
    }

    #[test]
    fn test_append_and_query_in_document_order() {
        let mut page = Page::new();
        let root = page.root();
        let a = page.append(root, post("a")).unwrap();
        let b = page.append(root, post("b")).unwrap();

        assert_eq!(page.query_all(root, "article"), vec![a, b]);
        assert_eq!(page.query_all(root, "img").len(), 2);
        assert_eq!(page.text_content(a), "hello world");
        assert_eq!(page.query_all(a, "article"), Vec::<ElementHandle>::new());
    }

    #[test]
    fn test_removed_handles_go_stale() {
        let mut page = Page::new();
        let root = page.root();
        let a = page.append(root, post("a")).unwrap();
        let img = page.query_first(a, "img").unwrap();

        assert!(page.remove(a));
        assert!(!page.contains(a));
        assert!(!page.contains(img));
        assert!(!page.set_attr(a, MARK_ATTR, "true"));
        assert!(!page.remove(a));

        // A reused slot does not revive the old handle.
        let b = page.append(root, post("b")).unwrap();
        assert!(page.contains(b));
        assert!(!page.contains(a));
        assert_eq!(page.append(a, post("c")), None);
    }

    #[test]
    fn test_closest_is_inclusive() {
        let mut page = Page::new();
        let root = page.root();
        let a = page
            .append(
                root,
                ElementSpec::new("article").child(
                    ElementSpec::new("a")
                        .attr("href", "/u/status/1")
                        .child(ElementSpec::new("time").attr("datetime", "t")),
                ),
            )
            .unwrap();
        let time = page.query_first(a, "time").unwrap();
        let link = page.query_first(a, "a").unwrap();

        assert_eq!(page.closest(time, "a"), Some(link));
        assert_eq!(page.closest(link, "a"), Some(link));
        assert_eq!(page.closest(time, "article"), Some(a));
        assert_eq!(page.closest(a, "a"), None);
    }

    #[test]
    fn test_visibility_follows_markers() {
        let mut page = Page::new();
        let root = page.root();
        let a = page.append(root, post("a")).unwrap();
        assert!(page.is_visible(a));

        page.set_attr(a, MARK_ATTR, "true");
        assert!(!page.is_visible(a));

        page.set_attr(a, PROCESSED_ATTR, "true");
        page.set_attr(a, MUTED_ATTR, "true");
        assert!(!page.is_visible(a));

        page.set_attr(a, MUTED_ATTR, "false");
        assert!(page.is_visible(a));

        page.remove(a);
        assert!(!page.is_visible(a));
    }

    #[test]
    fn test_observer_receives_insertions_until_disconnected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut page = Page::new();
        let root = page.root();
        page.observe(tx);

        let a = page.append(root, post("a")).unwrap();
        let inner = page.append(a, ElementSpec::new("span")).unwrap();
        assert_eq!(rx.try_recv().unwrap().added, vec![a]);
        assert_eq!(rx.try_recv().unwrap().added, vec![inner]);

        page.disconnect();
        page.append(root, post("b")).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_observed_insertions_stay_hidden_until_acknowledged() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut page = Page::new();
        let root = page.root();
        page.observe(tx);

        let wrapper = page
            .append(root, ElementSpec::new("div").child(post("a")))
            .unwrap();
        let a = page.query_first(wrapper, "article").unwrap();
        assert!(!page.is_visible(wrapper));
        assert!(!page.is_visible(a));

        let record = rx.try_recv().unwrap();
        page.acknowledge(&record.added);
        assert!(page.is_visible(a));

        let b = page.append(root, post("b")).unwrap();
        assert!(!page.is_visible(b));
        page.disconnect();
        assert!(page.is_visible(b));

        // Nothing is held back while unobserved.
        let c = page.append(root, post("c")).unwrap();
        assert!(page.is_visible(c));
    }
}
