use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Directory layout rooted at the configured data directory.
///
/// ```text
/// My/{site}/Planet.json
/// My/{site}/Articles/{article}.json
/// My/{site}/Articles/Drafts/{draft}/Draft.json
/// My/{site}/ops.json
/// Public/{site}/planet.json
/// Public/{site}/index.html
/// Public/{site}/{article}/index.html, article.json, attachments...
/// Following/{site}/Planet.json
/// Following/{site}/Articles/{article}.json
/// Following/{site}/Avatar.png
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

/// Directory names use the uppercase hyphenated UUID form.
pub fn id_dir(id: Uuid) -> String {
    id.to_string().to_uppercase()
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn my_root(&self) -> PathBuf {
        self.root.join("My")
    }

    pub fn following_root(&self) -> PathBuf {
        self.root.join("Following")
    }

    pub fn public_root(&self) -> PathBuf {
        self.root.join("Public")
    }

    pub fn owned_dir(&self, site: Uuid) -> PathBuf {
        self.my_root().join(id_dir(site))
    }

    pub fn owned_info(&self, site: Uuid) -> PathBuf {
        self.owned_dir(site).join("Planet.json")
    }

    pub fn owned_articles_dir(&self, site: Uuid) -> PathBuf {
        self.owned_dir(site).join("Articles")
    }

    pub fn owned_article(&self, site: Uuid, article: Uuid) -> PathBuf {
        self.owned_articles_dir(site)
            .join(format!("{}.json", id_dir(article)))
    }

    pub fn drafts_dir(&self, site: Uuid) -> PathBuf {
        self.owned_articles_dir(site).join("Drafts")
    }

    pub fn draft_dir(&self, site: Uuid, draft: Uuid) -> PathBuf {
        self.drafts_dir(site).join(id_dir(draft))
    }

    pub fn draft_info(&self, site: Uuid, draft: Uuid) -> PathBuf {
        self.draft_dir(site, draft).join("Draft.json")
    }

    pub fn ops_file(&self, site: Uuid) -> PathBuf {
        self.owned_dir(site).join("ops.json")
    }

    pub fn public_dir(&self, site: Uuid) -> PathBuf {
        self.public_root().join(id_dir(site))
    }

    pub fn public_manifest(&self, site: Uuid) -> PathBuf {
        self.public_dir(site).join("planet.json")
    }

    pub fn public_index(&self, site: Uuid) -> PathBuf {
        self.public_dir(site).join("index.html")
    }

    pub fn public_article_dir(&self, site: Uuid, article: Uuid) -> PathBuf {
        self.public_dir(site).join(id_dir(article))
    }

    pub fn public_slug_dir(&self, site: Uuid, slug: &str) -> PathBuf {
        self.public_dir(site).join(slug)
    }

    pub fn followed_dir(&self, site: Uuid) -> PathBuf {
        self.following_root().join(id_dir(site))
    }

    pub fn followed_info(&self, site: Uuid) -> PathBuf {
        self.followed_dir(site).join("Planet.json")
    }

    pub fn followed_articles_dir(&self, site: Uuid) -> PathBuf {
        self.followed_dir(site).join("Articles")
    }

    pub fn followed_article(&self, site: Uuid, article: Uuid) -> PathBuf {
        self.followed_articles_dir(site)
            .join(format!("{}.json", id_dir(article)))
    }

    pub fn followed_avatar(&self, site: Uuid) -> PathBuf {
        self.followed_dir(site).join("Avatar.png")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_documented_layout() {
        let layout = Layout::new("/data");
        let site = Uuid::parse_str("6f1e3c64-6e7a-4c0b-9f6b-2b7c1b0c4c11").unwrap();
        let article = Uuid::parse_str("0b0a5b1e-0d9b-4b07-9f7e-3c1c7f5e9a01").unwrap();
        assert_eq!(
            layout.owned_article(site, article),
            PathBuf::from("/data/My/6F1E3C64-6E7A-4C0B-9F6B-2B7C1B0C4C11/Articles/0B0A5B1E-0D9B-4B07-9F7E-3C1C7F5E9A01.json")
        );
        assert_eq!(
            layout.draft_info(site, article),
            PathBuf::from("/data/My/6F1E3C64-6E7A-4C0B-9F6B-2B7C1B0C4C11/Articles/Drafts/0B0A5B1E-0D9B-4B07-9F7E-3C1C7F5E9A01/Draft.json")
        );
        assert_eq!(
            layout.public_manifest(site),
            PathBuf::from("/data/Public/6F1E3C64-6E7A-4C0B-9F6B-2B7C1B0C4C11/planet.json")
        );
        assert_eq!(
            layout.followed_avatar(site),
            PathBuf::from("/data/Following/6F1E3C64-6E7A-4C0B-9F6B-2B7C1B0C4C11/Avatar.png")
        );
    }
}
