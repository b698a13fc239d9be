const DEFAULT_MAIN: &str = include_str!("../templates/index.html");
const DEFAULT_LOGIN: &str = include_str!("../templates/login.html");
const ROOT_KEYS_PLACEHOLDER: &str = "{{root_keys}}";

/// Login page and the main page, the latter rendered once with the root keys filled in.
#[derive(Debug, Clone)]
pub struct Pages {
    main: String,
    login: String,
}

impl Pages {
    /// Templates in `template_dir` (`index.html`, `login.html`) replace the built-in ones.
    pub fn load(
        template_dir: Option<&std::path::Path>,
        root_keys: Vec<String>,
    ) -> std::io::Result<Self> {
        let (main, login) = match template_dir {
            Some(dir) => {
                crate::log_info!("Loading page templates from {:?}", dir);
                (
                    std::fs::read_to_string(dir.join("index.html"))?,
                    std::fs::read_to_string(dir.join("login.html"))?,
                )
            }
            None => (DEFAULT_MAIN.to_owned(), DEFAULT_LOGIN.to_owned()),
        };

        let keys = serde_json::to_string(&root_keys)?.replace("</", "<\\/");

        Ok(Self {
            main: main.replace(ROOT_KEYS_PLACEHOLDER, &keys),
            login,
        })
    }

    /// The main page. The login endpoint answers with exactly these bytes on success.
    pub fn render_main(&self) -> axum::response::Html<String> {
        axum::response::Html(self.main.clone())
    }

    pub fn render_login(&self) -> axum::response::Html<String> {
        axum::response::Html(self.login.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_page_embeds_root_keys() {
        let pages = Pages::load(None, vec!["movie".to_owned(), "tv</script>".to_owned()])
            .expect("pages");
        let axum::response::Html(body) = pages.render_main();
        assert!(body.contains(r#"const ROOT_KEYS = ["movie","tv<\/script>"];"#));
        assert!(!body.contains(ROOT_KEYS_PLACEHOLDER));
        assert!(!pages.main.contains(ROOT_KEYS_PLACEHOLDER));
        assert_eq!(pages.render_main().0, body);
    }

    #[test]
    fn template_dir_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("index.html"), "keys={{root_keys}}").expect("write");
        std::fs::write(dir.path().join("login.html"), "login").expect("write");

        let pages = Pages::load(Some(dir.path()), vec!["movie".to_owned()]).expect("pages");
        assert_eq!(pages.render_main().0, r#"keys=["movie"]"#);
        assert_eq!(pages.render_login().0, "login");

        std::fs::remove_file(dir.path().join("login.html")).expect("rm");
        assert!(Pages::load(Some(dir.path()), Vec::new()).is_err());
    }
}
