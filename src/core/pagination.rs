use serde::Deserialize;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn parse(value: Option<&str>) -> Option<Self> {
        match value?.to_ascii_lowercase().as_str() {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }
}

/// Per-endpoint listing rules: page-size cap and the sort allow-list.
#[derive(Debug, Clone, Copy)]
pub struct ListSpec {
    pub default_per_page: u32,
    pub max_per_page: u32,
    pub sort_fields: &'static [&'static str],
    pub default_sort: &'static str,
    pub default_order: SortOrder,
}

/// Raw paging parameters. Kept as strings so the struct can be flattened
/// into endpoint query types.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageParams {
    pub page: Option<String>,
    pub per_page: Option<String>,
    pub sort: Option<String>,
    pub order: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
    pub sort: &'static str,
    pub order: SortOrder,
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: u32,
    pub per_page: u32,
}

impl PageParams {
    /// Out-of-range or unparsable values fall back to the endpoint defaults.
    pub fn resolve(&self, spec: &ListSpec) -> PageRequest {
        let page = self
            .page
            .as_deref()
            .and_then(|p| p.trim().parse::<u32>().ok())
            .filter(|p| *p >= 1)
            .unwrap_or(1);

        let per_page = self
            .per_page
            .as_deref()
            .and_then(|p| p.trim().parse::<u32>().ok())
            .filter(|p| (1..=spec.max_per_page).contains(p))
            .unwrap_or(spec.default_per_page);

        let sort = self
            .sort
            .as_deref()
            .and_then(|s| spec.sort_fields.iter().find(|f| **f == s).copied())
            .unwrap_or(spec.default_sort);

        let order = SortOrder::parse(self.order.as_deref()).unwrap_or(spec.default_order);

        PageRequest {
            page,
            per_page,
            sort,
            order,
        }
    }
}

impl PageRequest {
    /// Rows to skip before the requested page.
    pub fn offset(&self) -> usize {
        (self.page as usize - 1).saturating_mul(self.per_page as usize)
    }

    /// Sorts with `compare(a, b, sort_field)` and slices out the requested page.
    pub fn apply<T>(&self, mut items: Vec<T>, compare: impl Fn(&T, &T, &str) -> Ordering) -> Page<T> {
        let sort = self.sort;
        let order = self.order;
        items.sort_by(|a, b| {
            let ordering = compare(a, b, sort);
            match order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let total = items.len();
        let items = items
            .into_iter()
            .skip(self.offset())
            .take(self.per_page as usize)
            .collect();

        Page {
            items,
            total,
            page: self.page,
            per_page: self.per_page,
        }
    }
}

/// Compares optional values with `None` sorting last in ascending order.
pub fn cmp_option<T: Ord>(a: &Option<T>, b: &Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
