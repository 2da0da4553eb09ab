//! Pending-interceptor bookkeeping.
//!
//! A resource carries an ordered list of handlers that still have to process it, stored as a
//! comma separated annotation. A handler only acts when it is at the head of that list, and
//! removes itself once done. An absent annotation means nothing is pending; the list is never
//! written back as an empty value.

use kube::{Resource, ResourceExt as _};

/// Annotation holding the ordered pending-interceptor names.
pub const PENDING_ANNOTATION: &str = "interceptors.kubernetes.io/pending";

/// Access to the pending-interceptor list of any kubernetes resource.
pub trait PendingInterceptors {
    /// The pending names in order, or `None` when the list is absent.
    fn pending_interceptors(&self) -> Option<Vec<String>>;

    /// Whether `name` is at the head of the pending list.
    fn is_claimed_by(&self, name: &str) -> bool {
        self.pending_interceptors()
            .and_then(|pending| pending.into_iter().next())
            .is_some_and(|head| head == name)
    }

    /// Remove the head of the pending list, returning what remains.
    ///
    /// Returns `None` when the list became (or already was) absent.
    fn pop_interceptor(&mut self) -> Option<Vec<String>>;
}

impl<K: Resource> PendingInterceptors for K {
    fn pending_interceptors(&self) -> Option<Vec<String>> {
        let raw = self.annotations().get(PENDING_ANNOTATION)?;
        let pending = parse(raw);
        (!pending.is_empty()).then_some(pending)
    }

    fn pop_interceptor(&mut self) -> Option<Vec<String>> {
        let remaining: Vec<String> = self
            .pending_interceptors()
            .map(|pending| pending.into_iter().skip(1).collect())
            .unwrap_or_default();

        if remaining.is_empty() {
            self.annotations_mut().remove(PENDING_ANNOTATION);
            None
        } else {
            self.annotations_mut()
                .insert(PENDING_ANNOTATION.to_string(), format(&remaining));
            Some(remaining)
        }
    }
}

fn parse(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect()
}

/// Render a pending list as the annotation value.
pub fn format(pending: &[String]) -> String {
    pending.join(",")
}
