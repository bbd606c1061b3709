use serde::{Deserialize, Serialize};

/// A config field that may be absent, explicitly null, a single value, or a list.
#[derive(Default, Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum NoneOrSome<T> {
    #[serde(skip_deserializing)]
    #[default]
    Unspecified,
    None,
    One(T),
    Some(Vec<T>),
}

impl<T> NoneOrSome<T> {
    pub fn is_empty(&self) -> bool {
        match self {
            NoneOrSome::Unspecified | NoneOrSome::None => true,
            NoneOrSome::One(_) => false,
            NoneOrSome::Some(v) => v.is_empty(),
        }
    }

    pub fn into_vec(self) -> Vec<T> {
        match self {
            NoneOrSome::Unspecified | NoneOrSome::None => vec![],
            NoneOrSome::One(item) => vec![item],
            NoneOrSome::Some(v) => v,
        }
    }

    pub fn as_slice(&self) -> &[T] {
        match self {
            NoneOrSome::Unspecified | NoneOrSome::None => &[],
            NoneOrSome::One(item) => std::slice::from_ref(item),
            NoneOrSome::Some(v) => v,
        }
    }
}

impl<T> From<Vec<T>> for NoneOrSome<T> {
    fn from(v: Vec<T>) -> Self {
        NoneOrSome::Some(v)
    }
}
