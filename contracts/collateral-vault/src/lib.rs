//! Collateral Vault Contract
//!
//! Holds pledged marketplace NFTs in escrow for the duration of a loan.
//! Custody is taken when a loan is funded and released when the loan is
//! resolved, and only the registered loan manager may command either move.

#![no_std]

use soroban_sdk::{
    contract, contractimpl, contracttype, symbol_short, Address, Env, IntoVal, Symbol, Val, Vec,
};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[contracttype]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContractError {
    Unauthorized = 1,
    AlreadyInitialized = 2,
    AlreadyInCustody = 3,
    NotInCustody = 4,
}

impl From<soroban_sdk::Error> for ContractError {
    fn from(_: soroban_sdk::Error) -> Self {
        ContractError::Unauthorized
    }
}

impl From<&ContractError> for soroban_sdk::Error {
    fn from(err: &ContractError) -> Self {
        soroban_sdk::Error::from_contract_error(*err as u32)
    }
}

impl From<ContractError> for soroban_sdk::Error {
    fn from(err: ContractError) -> Self {
        soroban_sdk::Error::from_contract_error(err as u32)
    }
}

/// Record of a single escrowed asset, keyed by (collateral contract, token id).
#[contracttype]
#[derive(Clone, Debug)]
pub struct Holding {
    pub collateral_contract: Address,
    pub token_id: u64,
    pub pledged_by: Address,
    pub taken_at: u64,
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

#[contract]
pub struct CollateralVault;

#[contractimpl]
impl CollateralVault {
    /// Initialize the vault with an admin and the loan manager address.
    pub fn initialize(env: Env, admin: Address, manager: Address) -> Result<(), ContractError> {
        if env.storage().instance().has(&symbol_short!("admin")) {
            return Err(ContractError::AlreadyInitialized);
        }

        env.storage()
            .instance()
            .set(&symbol_short!("admin"), &admin);
        env.storage()
            .instance()
            .set(&symbol_short!("manager"), &manager);

        env.events()
            .publish((symbol_short!("vlt_init"),), (admin, manager));

        Ok(())
    }

    /// Replace the registered loan manager. Admin only.
    pub fn set_manager(env: Env, manager: Address) -> Result<(), ContractError> {
        let admin: Address = env
            .storage()
            .instance()
            .get(&symbol_short!("admin"))
            .ok_or(ContractError::Unauthorized)?;

        admin.require_auth();

        env.storage()
            .instance()
            .set(&symbol_short!("manager"), &manager);

        env.events()
            .publish((symbol_short!("mgr_set"),), (manager,));

        Ok(())
    }

    /// Take custody of a pledged asset from its owner.
    ///
    /// Pulls the NFT into the vault via `transfer_from`, which requires the
    /// owner to have approved the vault beforehand. Only the loan manager may
    /// call this; the holding record is written before the external transfer.
    pub fn take_custody(
        env: Env,
        collateral_contract: Address,
        token_id: u64,
        from: Address,
    ) -> Result<(), ContractError> {
        Self::require_manager(&env)?;

        let key = (
            symbol_short!("holding"),
            collateral_contract.clone(),
            token_id,
        );
        if env.storage().persistent().has(&key) {
            return Err(ContractError::AlreadyInCustody);
        }

        let holding = Holding {
            collateral_contract: collateral_contract.clone(),
            token_id,
            pledged_by: from.clone(),
            taken_at: env.ledger().timestamp(),
        };
        env.storage().persistent().set(&key, &holding);

        let vault = env.current_contract_address();
        let args: Vec<Val> = Vec::from_array(
            &env,
            [
                vault.clone().into_val(&env),
                from.clone().into_val(&env),
                vault.into_val(&env),
                token_id.into_val(&env),
            ],
        );
        env.invoke_contract::<Val>(
            &collateral_contract,
            &Symbol::new(&env, "transfer_from"),
            args,
        );

        env.events().publish(
            (symbol_short!("cust_take"),),
            (collateral_contract, token_id, from),
        );

        Ok(())
    }

    /// Release an escrowed asset to the resolved party.
    ///
    /// The loan manager decides who the rightful recipient is (borrower on
    /// repayment, lender on foreclosure); the vault only enforces that the
    /// asset is actually in custody and that the caller is the manager.
    pub fn release_custody(
        env: Env,
        collateral_contract: Address,
        token_id: u64,
        to: Address,
    ) -> Result<(), ContractError> {
        Self::require_manager(&env)?;

        let key = (
            symbol_short!("holding"),
            collateral_contract.clone(),
            token_id,
        );
        if !env.storage().persistent().has(&key) {
            return Err(ContractError::NotInCustody);
        }
        env.storage().persistent().remove(&key);

        let vault = env.current_contract_address();
        let args: Vec<Val> = Vec::from_array(
            &env,
            [
                vault.clone().into_val(&env),
                vault.into_val(&env),
                to.clone().into_val(&env),
                token_id.into_val(&env),
            ],
        );
        env.invoke_contract::<Val>(
            &collateral_contract,
            &Symbol::new(&env, "transfer_from"),
            args,
        );

        env.events().publish(
            (symbol_short!("cust_rel"),),
            (collateral_contract, token_id, to),
        );

        Ok(())
    }

    /// Get the holding record for an asset, if escrowed.
    pub fn get_holding(
        env: Env,
        collateral_contract: Address,
        token_id: u64,
    ) -> Option<Holding> {
        env.storage()
            .persistent()
            .get(&(symbol_short!("holding"), collateral_contract, token_id))
    }

    /// Whether an asset is currently in custody.
    pub fn is_held(env: Env, collateral_contract: Address, token_id: u64) -> bool {
        env.storage()
            .persistent()
            .has(&(symbol_short!("holding"), collateral_contract, token_id))
    }

    fn require_manager(env: &Env) -> Result<(), ContractError> {
        let manager: Address = env
            .storage()
            .instance()
            .get(&symbol_short!("manager"))
            .ok_or(ContractError::Unauthorized)?;
        manager.require_auth();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
