/// Ordered run of elements moved between stages as one unit.
///
/// Credit is debited per element, but a batch is always emitted whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T>(Vec<T>);

impl<T> Default for Batch<T> {
	fn default() -> Self {
		Self(Vec::new())
	}
}

impl<T> Batch<T> {
	pub fn new(items: Vec<T>) -> Self {
		Self(items)
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn as_slice(&self) -> &[T] {
		&self.0
	}

	pub fn into_vec(self) -> Vec<T> {
		self.0
	}

	pub fn iter(&self) -> std::slice::Iter<'_, T> {
		self.0.iter()
	}
}

impl<T> From<Vec<T>> for Batch<T> {
	fn from(items: Vec<T>) -> Self {
		Self(items)
	}
}

impl<T> FromIterator<T> for Batch<T> {
	fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
		Self(iter.into_iter().collect())
	}
}

impl<T> IntoIterator for Batch<T> {
	type Item = T;
	type IntoIter = std::vec::IntoIter<T>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.into_iter()
	}
}
