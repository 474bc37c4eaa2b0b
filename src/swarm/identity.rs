/// Identity providers: where each new connection's nick/user/realname comes from.
use std::str::FromStr;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;

/// Nickname, username (ident), and "real name" for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub nickname: String,
    pub username: String,
    pub realname: String,
}

impl Identity {
    pub fn new(nickname: &str, username: &str, realname: &str) -> Self {
        Self {
            nickname: nickname.to_owned(),
            username: username.to_owned(),
            realname: realname.to_owned(),
        }
    }
}

const THEME_FORMER: &[&str] = &[
    "Black", "White", "Grey", "Crimson", "Azure", "Aqua", "Violet", "Ash", "Blood", "Argent",
    "Copper", "Zinc", "Iron", "Gold", "Silver", "Chrome", "Cobalt",
];
const THEME_LATTER: &[&str] = &[
    "Wolf", "Eagle", "Fox", "Bear", "Scorpion", "Deer", "Swallow", "Goat", "Dragon",
];

/// Random identity fields are lowercase ASCII of this inclusive length range.
const RANDOM_LEN: (usize, usize) = (2, 11);

/// Strategy for producing the next identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum IdentityProvider {
    /// The same identity every time.
    Fixed(Identity),
    /// Independent random lowercase strings for each field.
    #[default]
    Random,
    /// A colour/creature word pair used for all three fields.
    Themed,
}

impl IdentityProvider {
    pub fn fixed_default() -> Self {
        Self::Fixed(Identity::new("CobaltLongclaw", "CobaltLongclaw", "CobaltLongclaw r2"))
    }

    pub fn next_identity(&self) -> Identity {
        let mut rng = rand::thread_rng();
        match self {
            Self::Fixed(identity) => identity.clone(),
            Self::Random => Identity {
                nickname: random_string(&mut rng),
                username: random_string(&mut rng),
                realname: random_string(&mut rng),
            },
            Self::Themed => {
                let former = THEME_FORMER.choose(&mut rng).copied().unwrap_or("Cobalt");
                let latter = THEME_LATTER.choose(&mut rng).copied().unwrap_or("Wolf");
                let name = format!("{former}{latter}");
                Identity::new(&name, &name, &name)
            }
        }
    }
}

fn random_string(rng: &mut impl Rng) -> String {
    let len = rng.gen_range(RANDOM_LEN.0..=RANDOM_LEN.1);
    (0..len).map(|_| char::from(rng.gen_range(b'a'..=b'z'))).collect()
}

#[derive(Debug, thiserror::Error)]
#[error("unknown identity provider {0:?} (expected fixed, random or themed)")]
pub struct UnknownProvider(String);

impl FromStr for IdentityProvider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::fixed_default()),
            "random" => Ok(Self::Random),
            "themed" | "animal" => Ok(Self::Themed),
            other => Err(UnknownProvider(other.to_owned())),
        }
    }
}
