use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);

/// Headline categories the dashboard offers, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewsCategory {
    #[default]
    Technology,
    Business,
    Sports,
    Science,
}

impl NewsCategory {
    pub const ALL: [NewsCategory; 4] = [
        NewsCategory::Technology,
        NewsCategory::Business,
        NewsCategory::Sports,
        NewsCategory::Science,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NewsCategory::Technology => "technology",
            NewsCategory::Business => "business",
            NewsCategory::Sports => "sports",
            NewsCategory::Science => "science",
        }
    }

    pub fn parse(value: &str) -> Option<NewsCategory> {
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == value.to_ascii_lowercase())
    }
}

impl std::fmt::Display for NewsCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
