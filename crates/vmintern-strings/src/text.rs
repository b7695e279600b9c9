use std::borrow::Borrow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::{Arc, Weak};

/// An immutable heap text value.
///
/// Equality is by content. Two values with equal content may still be
/// different allocations; [`Text::ptr_eq`] tells them apart, and interning
/// maps every value to the one canonical allocation.
#[derive(Clone)]
pub struct Text(Arc<str>);

impl Text {
    pub fn new(content: &str) -> Self {
        Self(Arc::from(content))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    pub fn downgrade(&self) -> WeakText {
        WeakText(Arc::downgrade(&self.0))
    }

    /// Strong holders of this allocation.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl PartialEq for Text {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for Text {}

impl Hash for Text {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state)
    }
}

impl Deref for Text {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Text {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Text {
    fn from(content: &str) -> Self {
        Self::new(content)
    }
}

impl From<String> for Text {
    fn from(content: String) -> Self {
        Self(Arc::from(content))
    }
}

impl fmt::Display for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

/// Row handle of the text table. Dead once every [`Text`] is gone.
#[derive(Clone, Debug)]
pub struct WeakText(Weak<str>);

impl WeakText {
    pub fn upgrade(&self) -> Option<Text> {
        self.0.upgrade().map(Text)
    }

    pub fn is_dead(&self) -> bool {
        self.0.strong_count() == 0
    }
}
