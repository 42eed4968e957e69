//! Language negotiation and the handful of localized messages used in error pages.

/// Country assumed for a bare language tag when the country is not the language code itself.
const DEFAULT_COUNTRIES: &[(&str, &str)] = &[
    ("cs", "CZ"),
    ("da", "DK"),
    ("el", "GR"),
    ("en", "US"),
    ("ja", "JP"),
    ("ko", "KR"),
    ("nb", "NO"),
    ("pt", "BR"),
    ("sv", "SE"),
    ("uk", "UA"),
    ("zh", "CN"),
];

/// A negotiated locale such as `fr_FR` with its character set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Locale {
    /// `ll` or `ll_CC`, or `C`.
    pub language: String,
    pub charset: String,
}

impl Locale {
    /// Parse a POSIX-ish or RFC 5646 tag: `fr`, `fr-fr`, `fr_FR.UTF-8`, `C`.
    pub fn parse(tag: &str) -> Self {
        let mut parts = tag.trim().splitn(2, '.');
        let name = parts.next().unwrap_or("");
        let charset = parts
            .next()
            .filter(|charset| !charset.is_empty())
            .unwrap_or("UTF-8")
            .to_string();
        let mut subtags = name.split(|c| c == '-' || c == '_');
        let language = subtags.next().unwrap_or("").to_ascii_lowercase();
        if language.len() < 2
            || language.len() > 3
            || !language.chars().all(|c| c.is_ascii_alphabetic())
        {
            return Self {
                language: "C".to_string(),
                charset,
            };
        }
        let country = match subtags.next() {
            Some(country) if country.len() == 2 => country.to_ascii_uppercase(),
            _ => DEFAULT_COUNTRIES
                .iter()
                .find(|(lang, _)| *lang == language)
                .map(|(_, country)| country.to_string())
                .unwrap_or_else(|| language.to_ascii_uppercase()),
        };
        Self {
            language: format!("{}_{}", language, country),
            charset,
        }
    }

    /// Pick the request locale from `Accept-Language` (first entry, quality ignored) and the
    /// charset parameter of `Content-Type`.
    pub fn negotiate(
        accept_language: Option<&str>,
        content_type: Option<&str>,
        default_locale: &str,
    ) -> Self {
        let accept = match accept_language {
            Some(accept) => accept,
            None => return Self::parse(default_locale),
        };
        let first = accept.split(|c| c == ',' || c == ';').next().unwrap_or("");
        let charset = content_type
            .and_then(|content_type| {
                content_type
                    .split(';')
                    .map(str::trim)
                    .find_map(|param| param.strip_prefix("charset="))
            })
            .unwrap_or("UTF-8");
        Self::parse(&format!("{}.{}", first.trim(), charset))
    }

    pub fn is_posix(&self) -> bool {
        self.language == "C"
    }

    /// Language directories to try, most specific first: `fr_FR`, then `fr`.
    pub fn search_dirs(&self) -> Vec<&str> {
        if self.is_posix() {
            return Vec::new();
        }
        let mut dirs = vec![self.language.as_str()];
        if let Some(index) = self.language.find('_') {
            dirs.push(&self.language[..index]);
        }
        dirs
    }

    /// The two-letter language code.
    pub fn language_code(&self) -> &str {
        self.language.split('_').next().unwrap_or("C")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Message {
    EnterUsername,
    UpgradeToHttps,
    WebInterfaceDisabled,
}

/// Translate an error-page message, falling back to English.
pub fn localize(locale: &Locale, message: Message) -> &'static str {
    match (locale.language_code(), message) {
        ("fr", Message::EnterUsername) => {
            "Saisissez votre nom d\u{2019}utilisateur et votre mot de passe, ou ceux de l\u{2019}administrateur, pour acc\u{e9}der \u{e0} cette page."
        }
        ("fr", Message::UpgradeToHttps) => {
            "Vous devez acc\u{e9}der \u{e0} cette page avec l\u{2019}URL https://"
        }
        ("fr", Message::WebInterfaceDisabled) => {
            "L\u{2019}interface web est actuellement d\u{e9}sactiv\u{e9}e."
        }
        ("de", Message::EnterUsername) => {
            "Geben Sie Ihren Benutzernamen und Ihr Passwort oder die des Administrators ein, um auf diese Seite zuzugreifen."
        }
        ("de", Message::UpgradeToHttps) => {
            "Sie m\u{fc}ssen auf diese Seite mit der URL https:// zugreifen"
        }
        ("de", Message::WebInterfaceDisabled) => {
            "Die Web-Oberfl\u{e4}che ist derzeit deaktiviert."
        }
        ("es", Message::EnterUsername) => {
            "Introduzca su nombre de usuario y contrase\u{f1}a o las del administrador para acceder a esta p\u{e1}gina."
        }
        ("es", Message::UpgradeToHttps) => "Debe acceder a esta p\u{e1}gina usando el URL https://",
        ("es", Message::WebInterfaceDisabled) => "La interfaz web est\u{e1} desactivada.",
        (_, Message::EnterUsername) => {
            "Enter your username and password or the root username and password to access this page."
        }
        (_, Message::UpgradeToHttps) => "You must access this page using the URL https://",
        (_, Message::WebInterfaceDisabled) => "The web interface is currently disabled.",
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    #[test_case("fr", "fr_FR" ; "bare language")]
    #[test_case("fr-ca", "fr_CA" ; "language and region")]
    #[test_case("en", "en_US" ; "default country table")]
    #[test_case("de_DE.ISO-8859-1", "de_DE" ; "posix form")]
    #[test_case("C", "C" ; "posix locale")]
    #[test_case("*", "C" ; "wildcard")]
    fn parse_normalizes(tag: &str, language: &str) {
        assert_eq!(Locale::parse(tag).language, language);
    }

    #[test]
    fn negotiate_uses_first_entry_and_charset() {
        let locale = Locale::negotiate(
            Some("de-DE;q=0.9, en;q=0.5"),
            Some("text/plain; charset=ISO-8859-1"),
            "C",
        );
        assert_eq!(locale.language, "de_DE");
        assert_eq!(locale.charset, "ISO-8859-1");
    }

    #[test]
    fn negotiate_falls_back_to_default() {
        assert!(Locale::negotiate(None, None, "C").is_posix());
        assert_eq!(Locale::negotiate(None, None, "es").language, "es_ES");
    }

    #[test]
    fn search_dirs_go_from_specific_to_general() {
        assert_eq!(Locale::parse("fr").search_dirs(), vec!["fr_FR", "fr"]);
        assert!(Locale::parse("C").search_dirs().is_empty());
    }

    #[test]
    fn unknown_languages_get_english_messages() {
        assert_eq!(
            localize(&Locale::parse("it"), Message::WebInterfaceDisabled),
            "The web interface is currently disabled."
        );
        assert!(localize(&Locale::parse("fr"), Message::UpgradeToHttps).contains("https://"));
    }
}
