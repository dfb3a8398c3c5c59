use std::collections::{BTreeSet, HashMap};

use haat_config::PrincipalSeed;
use haat_contracts::Role;
use haat_kernel::{CatalogItem, Principal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyPrefs {
    pub chat: bool,
    pub in_app: bool,
}

impl NotifyPrefs {
    pub fn allows_chat(&self) -> bool {
        self.chat && self.in_app
    }
}

pub trait Directory: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<Principal>;
    fn principal(&self, id: &str) -> Option<Principal>;
    fn product(&self, id: &str) -> Option<CatalogItem>;
    /// Farmers a buyer follows.
    fn subscribed_farmers(&self, buyer: &str) -> Vec<String>;
    /// Principals on the other side of any past order with `principal`.
    fn trade_partners(&self, principal: &str) -> Vec<String>;
    fn notify_prefs(&self, principal: &str) -> NotifyPrefs;
}

struct Entry {
    principal: Principal,
    prefs: NotifyPrefs,
    subscribed_farmers: Vec<String>,
}

pub struct StaticDirectory {
    principals: HashMap<String, Entry>,
    tokens: HashMap<String, String>,
    products: HashMap<String, CatalogItem>,
    partners: HashMap<String, BTreeSet<String>>,
}

impl StaticDirectory {
    pub fn from_config(cfg: &haat_config::Directory) -> Self {
        let mut principals = HashMap::new();
        let mut tokens = HashMap::new();
        for seed in &cfg.principals {
            tokens.insert(seed.token.clone(), seed.id.clone());
            principals.insert(seed.id.clone(), entry(seed));
        }

        let products = cfg
            .products
            .iter()
            .map(|p| {
                (
                    p.id.clone(),
                    CatalogItem {
                        id: p.id.clone(),
                        name: p.name.clone(),
                        owner: p.owner.clone(),
                    },
                )
            })
            .collect();

        let mut partners: HashMap<String, BTreeSet<String>> = HashMap::new();
        for order in &cfg.orders {
            for farmer in &order.farmers {
                partners
                    .entry(order.buyer.clone())
                    .or_default()
                    .insert(farmer.clone());
                partners
                    .entry(farmer.clone())
                    .or_default()
                    .insert(order.buyer.clone());
            }
        }

        Self {
            principals,
            tokens,
            products,
            partners,
        }
    }
}

fn entry(seed: &PrincipalSeed) -> Entry {
    Entry {
        principal: Principal {
            id: seed.id.clone(),
            name: seed.name.clone(),
            role: seed.role,
            active: seed.active,
            blocked: seed.blocked,
        },
        prefs: NotifyPrefs {
            chat: seed.notify_chat,
            in_app: seed.notify_in_app,
        },
        subscribed_farmers: seed.subscribed_farmers.clone(),
    }
}

impl Directory for StaticDirectory {
    fn authenticate(&self, token: &str) -> Option<Principal> {
        if token.is_empty() {
            return None;
        }
        self.tokens
            .get(token)
            .and_then(|id| self.principal(id))
    }

    fn principal(&self, id: &str) -> Option<Principal> {
        self.principals.get(id).map(|e| e.principal.clone())
    }

    fn product(&self, id: &str) -> Option<CatalogItem> {
        self.products.get(id).cloned()
    }

    fn subscribed_farmers(&self, buyer: &str) -> Vec<String> {
        match self.principals.get(buyer) {
            Some(e) if e.principal.role == Role::Buyer => e.subscribed_farmers.clone(),
            _ => Vec::new(),
        }
    }

    fn trade_partners(&self, principal: &str) -> Vec<String> {
        self.partners
            .get(principal)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn notify_prefs(&self, principal: &str) -> NotifyPrefs {
        self.principals
            .get(principal)
            .map(|e| e.prefs)
            .unwrap_or(NotifyPrefs {
                chat: false,
                in_app: false,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haat_config::{OrderSeed, ProductSeed};

    fn seed(id: &str, role: Role) -> PrincipalSeed {
        PrincipalSeed {
            id: id.to_string(),
            name: id.to_uppercase(),
            role,
            token: format!("tok-{id}"),
            active: true,
            blocked: false,
            notify_chat: true,
            notify_in_app: true,
            subscribed_farmers: Vec::new(),
        }
    }

    fn directory() -> StaticDirectory {
        let mut buyer = seed("b1", Role::Buyer);
        buyer.subscribed_farmers = vec!["f1".to_string()];
        StaticDirectory::from_config(&haat_config::Directory {
            principals: vec![buyer, seed("f1", Role::Farmer), seed("f2", Role::Farmer)],
            products: vec![ProductSeed {
                id: "p1".to_string(),
                name: "Tomatoes".to_string(),
                owner: "f1".to_string(),
            }],
            orders: vec![OrderSeed {
                buyer: "b1".to_string(),
                farmers: vec!["f2".to_string()],
            }],
        })
    }

    #[test]
    fn authenticates_by_token() {
        let dir = directory();
        assert_eq!(dir.authenticate("tok-f1").map(|p| p.id), Some("f1".to_string()));
        assert!(dir.authenticate("nope").is_none());
        assert!(dir.authenticate("").is_none());
    }

    #[test]
    fn orders_link_both_sides() {
        let dir = directory();
        assert_eq!(dir.trade_partners("b1"), vec!["f2"]);
        assert_eq!(dir.trade_partners("f2"), vec!["b1"]);
        assert!(dir.trade_partners("f1").is_empty());
        assert_eq!(dir.subscribed_farmers("b1"), vec!["f1"]);
        assert!(dir.subscribed_farmers("f1").is_empty());
    }

    #[test]
    fn unknown_principals_get_no_notifications() {
        let dir = directory();
        assert!(dir.notify_prefs("b1").allows_chat());
        assert!(!dir.notify_prefs("ghost").allows_chat());
        assert_eq!(dir.product("p1").map(|p| p.owner), Some("f1".to_string()));
    }
}
