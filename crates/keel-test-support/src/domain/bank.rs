//! Bank accounts: deposits, withdrawals and transfers.
//!
//! A transfer raises `TransferredOut` on the source account; the target
//! account reacts through a domain handler by raising `TransferredIn`.

use keel_core::aggregate::{AggregateCore, AggregateRoot, Roles, Transitions};
use keel_core::domain::{DomainHandlers, NavigationPath};
use keel_core::error::DomainError;
use keel_core::event::DomainEvent;
use keel_core::snapshot::Snapshotable;
use keel_core::types::TypeNameRegistry;
use serde::{Deserialize, Serialize};

/// An account was opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountOpened {
    /// Id of the new account.
    pub account_id: String,
    /// Account holder.
    pub owner: String,
}
impl DomainEvent for AccountOpened {}

/// Money was paid in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deposited {
    /// Amount paid in.
    pub amount: i64,
}
impl DomainEvent for Deposited {}

/// Money was paid out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Withdrawn {
    /// Amount paid out.
    pub amount: i64,
}
impl DomainEvent for Withdrawn {}

/// Money left this account towards another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferredOut {
    /// Source account.
    pub from_account: String,
    /// Target account.
    pub to_account: String,
    /// Amount moved.
    pub amount: i64,
}
impl DomainEvent for TransferredOut {}

/// Money arrived from another account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferredIn {
    /// Source account.
    pub from_account: String,
    /// Amount moved.
    pub amount: i64,
}
impl DomainEvent for TransferredIn {}

/// Any event that changes a balance.
pub trait BalanceChange: Send + Sync {
    /// Signed effect on the balance.
    fn delta(&self) -> i64;
}

impl BalanceChange for Deposited {
    fn delta(&self) -> i64 {
        self.amount
    }
}

impl BalanceChange for Withdrawn {
    fn delta(&self) -> i64 {
        -self.amount
    }
}

impl BalanceChange for TransferredOut {
    fn delta(&self) -> i64 {
        -self.amount
    }
}

impl BalanceChange for TransferredIn {
    fn delta(&self) -> i64 {
        self.amount
    }
}

/// Role of anything with a named holder.
pub trait Held {
    /// Name of the holder.
    fn holder(&self) -> &str;
}

/// Snapshot payload of an [`Account`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    /// Account holder.
    pub owner: String,
    /// Balance at snapshot time.
    pub balance: i64,
}

/// A bank account.
#[derive(Debug, Default)]
pub struct Account {
    core: AggregateCore,
    owner: String,
    balance: i64,
}

impl Account {
    /// Opens an account.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for an empty owner.
    pub fn open(id: &str, owner: &str) -> Result<Self, DomainError> {
        if owner.is_empty() {
            return Err(DomainError::Validation("an account needs an owner".into()));
        }
        let mut account = Self {
            core: AggregateCore::new(id),
            ..Self::default()
        };
        account.on_event(AccountOpened {
            account_id: id.to_owned(),
            owner: owner.to_owned(),
        })?;
        Ok(account)
    }

    /// Current balance.
    #[must_use]
    pub fn balance(&self) -> i64 {
        self.balance
    }

    /// Pays money in.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for a non-positive amount.
    pub fn deposit(&mut self, amount: i64) -> Result<(), DomainError> {
        ensure_positive(amount)?;
        self.on_event(Deposited { amount })
    }

    /// Pays money out.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for a non-positive amount or
    /// insufficient funds.
    pub fn withdraw(&mut self, amount: i64) -> Result<(), DomainError> {
        self.ensure_covers(amount)?;
        self.on_event(Withdrawn { amount })
    }

    /// Moves money to `to_account`. The target is credited during the
    /// unit-of-work cascade.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for a non-positive amount,
    /// insufficient funds or a transfer to the same account.
    pub fn transfer_to(&mut self, to_account: &str, amount: i64) -> Result<(), DomainError> {
        self.ensure_covers(amount)?;
        let from_account = self.id().unwrap_or_default().to_owned();
        if from_account == to_account {
            return Err(DomainError::Validation("cannot transfer to the same account".into()));
        }
        self.on_event(TransferredOut {
            from_account,
            to_account: to_account.to_owned(),
            amount,
        })
    }

    fn ensure_covers(&self, amount: i64) -> Result<(), DomainError> {
        ensure_positive(amount)?;
        if amount > self.balance {
            return Err(DomainError::Validation(format!(
                "insufficient funds: balance {}, requested {amount}",
                self.balance
            )));
        }
        Ok(())
    }
}

fn ensure_positive(amount: i64) -> Result<(), DomainError> {
    if amount <= 0 {
        return Err(DomainError::Validation(format!("amount must be positive, got {amount}")));
    }
    Ok(())
}

impl Held for Account {
    fn holder(&self) -> &str {
        &self.owner
    }
}

impl AggregateRoot for Account {
    fn core(&self) -> &AggregateCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut AggregateCore {
        &mut self.core
    }

    fn register_transitions(transitions: &mut Transitions<Self>) {
        transitions
            .on(|account: &mut Self, event: &AccountOpened| account.owner.clone_from(&event.owner))
            .on(|account: &mut Self, event: &Deposited| account.balance += event.delta())
            .on(|account: &mut Self, event: &Withdrawn| account.balance += event.delta())
            .on(|account: &mut Self, event: &TransferredOut| account.balance += event.delta())
            .on(|account: &mut Self, event: &TransferredIn| account.balance += event.delta());
    }

    fn register_roles(roles: &mut Roles<Self>) {
        roles.play::<dyn Held>(|account| account, |account| account);
    }

    fn register_domain_handlers(handlers: &mut DomainHandlers<Self>) {
        handlers.on_with_lock(
            NavigationPath::from_event(|event: &TransferredOut| Some(event.to_account.clone())),
            |account: &mut Self, event: &TransferredOut| {
                account.on_event(TransferredIn {
                    from_account: event.from_account.clone(),
                    amount: event.amount,
                })
            },
        );
    }
}

impl Snapshotable for Account {
    type Snapshot = AccountState;

    fn create_snapshot(&self) -> AccountState {
        AccountState {
            owner: self.owner.clone(),
            balance: self.balance,
        }
    }

    fn restore_from_snapshot(&mut self, snapshot: AccountState) {
        self.owner = snapshot.owner;
        self.balance = snapshot.balance;
    }
}

/// Registers the bank model's names, snapshot capability and supertypes.
///
/// # Errors
///
/// Returns a type-name error if any name is already taken.
pub fn register(types: &mut TypeNameRegistry) -> Result<(), DomainError> {
    types
        .register_aggregate::<Account>("bank.account")?
        .register_event::<AccountOpened>("bank.account-opened")?
        .register_event::<Deposited>("bank.deposited")?
        .register_event::<Withdrawn>("bank.withdrawn")?
        .register_event::<TransferredOut>("bank.transferred-out")?
        .register_event::<TransferredIn>("bank.transferred-in")?
        .register_snapshot::<Account>("bank.account-state")?
        .register_supertype::<Deposited, dyn BalanceChange>(|event| event)
        .register_supertype::<Withdrawn, dyn BalanceChange>(|event| event)
        .register_supertype::<TransferredOut, dyn BalanceChange>(|event| event)
        .register_supertype::<TransferredIn, dyn BalanceChange>(|event| event);
    Ok(())
}
