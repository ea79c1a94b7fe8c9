use std::fmt::Display;
use std::io;

use termenu::{Item, Menu};

/// Interactive single-choice menu over `items`.
pub struct Picker<T> {
    title: String,
    items: Vec<T>,
}

impl<T> Picker<T>
where
    T: Display + Clone,
{
    pub fn new(title: impl Into<String>, items: Vec<T>) -> Self {
        Self {
            title: title.into(),
            items,
        }
    }

    /// `Ok(None)` when the user backs out without choosing.
    pub fn invoke(&self) -> io::Result<Option<T>> {
        let mut menu = Menu::new()?;

        let list: Vec<Item<usize>> = self
            .items
            .iter()
            .enumerate()
            .map(|(idx, item)| Item::new(&item.to_string(), idx))
            .collect();

        let selected = menu.set_title(&self.title).add_list(list).select()?.copied();

        Ok(selected.and_then(|idx| self.items.get(idx).cloned()))
    }
}
