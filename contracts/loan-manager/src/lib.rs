//! Loan Manager Contract
//!
//! Peer-to-peer lending against marketplace NFTs. A borrower posts a loan
//! request against an NFT they own, a lender funds it in either the platform
//! token or the native asset, and the loan resolves by repayment (collateral
//! returns to the borrower) or by foreclosure after maturity (collateral
//! forfeits to the lender). Collateral sits in the collateral-vault contract
//! for the lifetime of the loan.

#![no_std]

use soroban_sdk::{
    contract, contractimpl, contracttype, symbol_short, token, vec, Address, Env, IntoVal,
    Symbol, Val, Vec,
};

/// Denominator for interest rates expressed in basis points.
const BPS_DENOMINATOR: i128 = 10_000;

/// Seconds in a Julian year, the accrual base for the annual rate.
const SECONDS_PER_YEAR: i128 = 31_557_600;

/// Annual interest rate applied when the contract is queried before
/// initialization (700 = 7%).
const DEFAULT_RATE_BPS: u32 = 700;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[contracttype]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestStatus {
    Open = 0,
    Cancelled = 1,
    Fulfilled = 2,
}

#[contracttype]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoanStatus {
    Active = 0,
    Repaid = 1,
    Foreclosed = 2,
}

/// How a loan was funded. Repayment must use the same denomination.
#[contracttype]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CurrencyMode {
    Token = 0,
    Native = 1,
}

#[contracttype]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContractError {
    Unauthorized = 1,
    AlreadyInitialized = 2,
    RequestNotFound = 3,
    RequestNotOpen = 4,
    LoanNotFound = 5,
    LoanNotActive = 6,
    LoanNotMatured = 7,
    InvalidAmount = 8,
    InvalidDuration = 9,
    NotCollateralOwner = 10,
    CollateralNotApproved = 11,
    CollateralEncumbered = 12,
    SelfFundingNotAllowed = 13,
    InsufficientPayment = 14,
    MathOverflow = 15,
    CurrencyMismatch = 16,
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

/// A borrower's standing offer to borrow against a specific NFT.
/// Never deleted; cancelled and fulfilled requests are kept for history.
#[contracttype]
#[derive(Clone, Debug)]
pub struct LoanRequest {
    pub request_id: u64,
    pub borrower: Address,
    pub collateral_contract: Address,
    pub collateral_token_id: u64,
    pub principal: i128,
    pub duration: u64,
    pub status: RequestStatus,
    pub created_at: u64,
}

/// A funded loan. `repayment_amount` is fixed at funding time and never
/// recomputed; maturity is `start_ts + duration`.
#[contracttype]
#[derive(Clone, Debug)]
pub struct Loan {
    pub loan_id: u64,
    pub request_id: u64,
    pub borrower: Address,
    pub lender: Address,
    pub collateral_contract: Address,
    pub collateral_token_id: u64,
    pub principal: i128,
    pub repayment_amount: i128,
    pub currency_mode: CurrencyMode,
    pub start_ts: u64,
    pub duration: u64,
    pub status: LoanStatus,
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

#[contract]
pub struct LoanManager;

#[contractimpl]
impl LoanManager {
    /// Initialize the engine.
    ///
    /// # Arguments
    /// * `admin` - Address allowed to change the interest rate
    /// * `token` - Platform fungible token used for token-denominated loans
    /// * `native` - Native asset contract used for native-denominated loans
    /// * `vault` - Collateral vault holding escrowed NFTs
    /// * `rate_bps` - Annual interest rate in basis points
    pub fn initialize(
        env: Env,
        admin: Address,
        token: Address,
        native: Address,
        vault: Address,
        rate_bps: u32,
    ) -> Result<(), ContractError> {
        if env.storage().instance().has(&symbol_short!("admin")) {
            return Err(ContractError::AlreadyInitialized);
        }
        if rate_bps > BPS_DENOMINATOR as u32 {
            return Err(ContractError::InvalidAmount);
        }

        env.storage()
            .instance()
            .set(&symbol_short!("admin"), &admin);
        env.storage()
            .instance()
            .set(&symbol_short!("token"), &token);
        env.storage()
            .instance()
            .set(&symbol_short!("native"), &native);
        env.storage()
            .instance()
            .set(&symbol_short!("vault"), &vault);
        env.storage()
            .instance()
            .set(&symbol_short!("rate_bps"), &rate_bps);
        env.storage()
            .instance()
            .set(&symbol_short!("next_rq"), &1u64);
        env.storage()
            .instance()
            .set(&symbol_short!("next_ln"), &1u64);

        env.events()
            .publish((symbol_short!("eng_init"),), (admin, token, vault, rate_bps));

        Ok(())
    }

    /// Update the annual interest rate. Admin only.
    ///
    /// Applies to future fundings; repayment amounts of existing loans were
    /// fixed when they were funded.
    pub fn set_interest_rate(env: Env, rate_bps: u32) -> Result<(), ContractError> {
        let admin: Address = env
            .storage()
            .instance()
            .get(&symbol_short!("admin"))
            .ok_or(ContractError::Unauthorized)?;

        admin.require_auth();

        if rate_bps > BPS_DENOMINATOR as u32 {
            return Err(ContractError::InvalidAmount);
        }

        env.storage()
            .instance()
            .set(&symbol_short!("rate_bps"), &rate_bps);

        env.events()
            .publish((symbol_short!("rate_set"),), (rate_bps,));

        Ok(())
    }

    /// Current annual interest rate in basis points.
    pub fn get_interest_rate(env: Env) -> u32 {
        env.storage()
            .instance()
            .get(&symbol_short!("rate_bps"))
            .unwrap_or(DEFAULT_RATE_BPS)
    }

    /// Repayment owed on `principal` borrowed for `duration` seconds at the
    /// current rate: principal plus simple interest, floored, so the result
    /// is never below the principal and equals it at duration zero.
    pub fn calculate_repayment_amount(
        env: Env,
        principal: i128,
        duration: u64,
    ) -> Result<i128, ContractError> {
        let rate_bps = Self::get_interest_rate(env);
        repayment_amount(principal, duration, rate_bps)
    }

    /// Post a loan request against an NFT the borrower owns.
    ///
    /// The borrower must already own the NFT and have approved the vault to
    /// take it; custody itself is only taken if and when the request is
    /// funded. At most one open request and one active loan may exist per
    /// NFT at any time.
    ///
    /// # Returns
    /// The sequential request ID
    pub fn request_loan(
        env: Env,
        borrower: Address,
        collateral_contract: Address,
        collateral_token_id: u64,
        principal: i128,
        duration: u64,
    ) -> Result<u64, ContractError> {
        borrower.require_auth();

        if principal <= 0 {
            return Err(ContractError::InvalidAmount);
        }
        if duration == 0 {
            return Err(ContractError::InvalidDuration);
        }

        let owner: Address = env.invoke_contract(
            &collateral_contract,
            &Symbol::new(&env, "owner_of"),
            Vec::from_array(&env, [collateral_token_id.into_val(&env)]),
        );
        if owner != borrower {
            return Err(ContractError::NotCollateralOwner);
        }

        let vault: Address = env
            .storage()
            .instance()
            .get(&symbol_short!("vault"))
            .ok_or(ContractError::Unauthorized)?;
        let approved: Option<Address> = env.invoke_contract(
            &collateral_contract,
            &Symbol::new(&env, "get_approved"),
            Vec::from_array(&env, [collateral_token_id.into_val(&env)]),
        );
        if approved != Some(vault) {
            return Err(ContractError::CollateralNotApproved);
        }

        let collateral_key = (
            symbol_short!("open_req"),
            collateral_contract.clone(),
            collateral_token_id,
        );
        let active_key = (
            symbol_short!("act_loan"),
            collateral_contract.clone(),
            collateral_token_id,
        );
        if env.storage().persistent().has(&collateral_key)
            || env.storage().persistent().has(&active_key)
        {
            return Err(ContractError::CollateralEncumbered);
        }

        let request_id: u64 = env
            .storage()
            .instance()
            .get(&symbol_short!("next_rq"))
            .unwrap_or(1);

        let request = LoanRequest {
            request_id,
            borrower: borrower.clone(),
            collateral_contract: collateral_contract.clone(),
            collateral_token_id,
            principal,
            duration,
            status: RequestStatus::Open,
            created_at: env.ledger().timestamp(),
        };

        env.storage()
            .persistent()
            .set(&(symbol_short!("request"), request_id), &request);
        env.storage().persistent().set(&collateral_key, &request_id);
        env.storage()
            .instance()
            .set(&symbol_short!("next_rq"), &(request_id + 1));

        push_id(&env, (symbol_short!("brw_reqs"), borrower.clone()), request_id);

        env.events().publish(
            (symbol_short!("req_new"),),
            (
                request_id,
                borrower,
                collateral_contract,
                collateral_token_id,
                principal,
                duration,
            ),
        );

        Ok(request_id)
    }

    /// Cancel an open request. Borrower only.
    pub fn cancel_request(env: Env, request_id: u64) -> Result<(), ContractError> {
        let mut request: LoanRequest = env
            .storage()
            .persistent()
            .get(&(symbol_short!("request"), request_id))
            .ok_or(ContractError::RequestNotFound)?;

        request.borrower.require_auth();

        if request.status != RequestStatus::Open {
            return Err(ContractError::RequestNotOpen);
        }

        request.status = RequestStatus::Cancelled;
        env.storage()
            .persistent()
            .set(&(symbol_short!("request"), request_id), &request);
        env.storage().persistent().remove(&(
            symbol_short!("open_req"),
            request.collateral_contract.clone(),
            request.collateral_token_id,
        ));

        env.events()
            .publish((symbol_short!("req_cncl"),), (request_id,));

        Ok(())
    }

    /// Fund an open request with the platform token.
    ///
    /// The lender must have approved this contract to spend the principal.
    /// Atomically fulfills the request, opens the loan, moves the NFT into
    /// the vault and the principal from lender to borrower.
    ///
    /// # Returns
    /// The sequential loan ID
    pub fn open_loan(env: Env, lender: Address, request_id: u64) -> Result<u64, ContractError> {
        let loan_id = Self::fund(&env, &lender, request_id, CurrencyMode::Token)?;

        let loan = Self::loan(&env, loan_id)?;
        let asset: Address = env
            .storage()
            .instance()
            .get(&symbol_short!("token"))
            .ok_or(ContractError::Unauthorized)?;
        token::Client::new(&env, &asset).transfer_from(
            &env.current_contract_address(),
            &lender,
            &loan.borrower,
            &loan.principal,
        );

        Ok(loan_id)
    }

    /// Fund an open request with the native asset.
    ///
    /// No allowance is involved; `amount` must equal the principal exactly,
    /// since no change can be returned.
    pub fn open_loan_native(
        env: Env,
        lender: Address,
        request_id: u64,
        amount: i128,
    ) -> Result<u64, ContractError> {
        let request: LoanRequest = env
            .storage()
            .persistent()
            .get(&(symbol_short!("request"), request_id))
            .ok_or(ContractError::RequestNotFound)?;
        if amount != request.principal {
            return Err(ContractError::InsufficientPayment);
        }

        let loan_id = Self::fund(&env, &lender, request_id, CurrencyMode::Native)?;

        let loan = Self::loan(&env, loan_id)?;
        let asset: Address = env
            .storage()
            .instance()
            .get(&symbol_short!("native"))
            .ok_or(ContractError::Unauthorized)?;
        token::Client::new(&env, &asset).transfer(&lender, &loan.borrower, &amount);

        Ok(loan_id)
    }

    /// Repay a token-denominated loan in full.
    ///
    /// Anyone may pay on the borrower's behalf; the payer must have approved
    /// this contract to spend the repayment amount. The collateral returns to
    /// the borrower. Valid at any time while the loan is active, including
    /// after maturity.
    pub fn repay(env: Env, payer: Address, loan_id: u64) -> Result<(), ContractError> {
        payer.require_auth();

        let loan = Self::settle_repayment(&env, loan_id, CurrencyMode::Token)?;

        let asset: Address = env
            .storage()
            .instance()
            .get(&symbol_short!("token"))
            .ok_or(ContractError::Unauthorized)?;
        token::Client::new(&env, &asset).transfer_from(
            &env.current_contract_address(),
            &payer,
            &loan.lender,
            &loan.repayment_amount,
        );
        Self::release_collateral(&env, &loan, &loan.borrower)?;

        Ok(())
    }

    /// Repay a native-denominated loan in full. `amount` must equal the
    /// repayment amount exactly.
    pub fn repay_native(
        env: Env,
        payer: Address,
        loan_id: u64,
        amount: i128,
    ) -> Result<(), ContractError> {
        payer.require_auth();

        let loan: Loan = Self::loan(&env, loan_id)?;
        if amount != loan.repayment_amount {
            return Err(ContractError::InsufficientPayment);
        }

        let loan = Self::settle_repayment(&env, loan_id, CurrencyMode::Native)?;

        let asset: Address = env
            .storage()
            .instance()
            .get(&symbol_short!("native"))
            .ok_or(ContractError::Unauthorized)?;
        token::Client::new(&env, &asset).transfer(&payer, &loan.lender, &amount);
        Self::release_collateral(&env, &loan, &loan.borrower)?;

        Ok(())
    }

    /// Foreclose a matured, unrepaid loan. Lender only, strictly after
    /// maturity. The collateral forfeits to the lender; no currency moves.
    pub fn foreclose(env: Env, loan_id: u64) -> Result<(), ContractError> {
        let mut loan: Loan = Self::loan(&env, loan_id)?;

        loan.lender.require_auth();

        if loan.status != LoanStatus::Active {
            return Err(ContractError::LoanNotActive);
        }

        let maturity = loan
            .start_ts
            .checked_add(loan.duration)
            .ok_or(ContractError::MathOverflow)?;
        if env.ledger().timestamp() <= maturity {
            return Err(ContractError::LoanNotMatured);
        }

        loan.status = LoanStatus::Foreclosed;
        env.storage()
            .persistent()
            .set(&(symbol_short!("loan"), loan_id), &loan);
        env.storage().persistent().remove(&(
            symbol_short!("act_loan"),
            loan.collateral_contract.clone(),
            loan.collateral_token_id,
        ));

        env.events()
            .publish((symbol_short!("loan_fcl"),), (loan_id,));

        let lender = loan.lender.clone();
        Self::release_collateral(&env, &loan, &lender)?;

        Ok(())
    }

    // -- Queries -----------------------------------------------------------

    /// Get a request by ID.
    pub fn get_request(env: Env, request_id: u64) -> Option<LoanRequest> {
        env.storage()
            .persistent()
            .get(&(symbol_short!("request"), request_id))
    }

    /// Get a loan by ID.
    pub fn get_loan(env: Env, loan_id: u64) -> Option<Loan> {
        env.storage()
            .persistent()
            .get(&(symbol_short!("loan"), loan_id))
    }

    /// The open request on an NFT, if any.
    pub fn open_requests(
        env: Env,
        collateral_contract: Address,
        collateral_token_id: u64,
    ) -> Option<u64> {
        env.storage().persistent().get(&(
            symbol_short!("open_req"),
            collateral_contract,
            collateral_token_id,
        ))
    }

    /// Requests posted by a borrower, in creation order.
    ///
    /// `status_filter`: 0 = all, 1 = Open, 2 = Cancelled, 3 = Fulfilled.
    pub fn get_loan_requests(env: Env, borrower: Address, status_filter: u32) -> Vec<LoanRequest> {
        let ids: Vec<u64> = env
            .storage()
            .persistent()
            .get(&(symbol_short!("brw_reqs"), borrower))
            .unwrap_or(vec![&env]);

        let mut out = vec![&env];
        for id in ids.iter() {
            let request: Option<LoanRequest> = env
                .storage()
                .persistent()
                .get(&(symbol_short!("request"), id));
            if let Some(request) = request {
                if status_filter == 0 || status_filter == request.status as u32 + 1 {
                    out.push_back(request);
                }
            }
        }
        out
    }

    /// Loans where the given party is the borrower, in creation order.
    ///
    /// `status_filter`: 0 = all, 1 = Active, 2 = Repaid, 3 = Foreclosed.
    pub fn get_loans_borrowed(env: Env, borrower: Address, status_filter: u32) -> Vec<Loan> {
        Self::loans_by_index(&env, (symbol_short!("brw_lns"), borrower), status_filter)
    }

    /// Loans where the given party is the lender, in creation order.
    ///
    /// `status_filter`: 0 = all, 1 = Active, 2 = Repaid, 3 = Foreclosed.
    pub fn get_loans_lent(env: Env, lender: Address, status_filter: u32) -> Vec<Loan> {
        Self::loans_by_index(&env, (symbol_short!("lnd_lns"), lender), status_filter)
    }

    // -- Internals ---------------------------------------------------------

    /// Shared funding path for both currency modes.
    ///
    /// Validates the request, fulfills it, records the active loan and takes
    /// custody of the collateral. All internal state is written before the
    /// vault is invoked; the caller performs the currency transfer last.
    fn fund(
        env: &Env,
        lender: &Address,
        request_id: u64,
        currency_mode: CurrencyMode,
    ) -> Result<u64, ContractError> {
        lender.require_auth();

        let mut request: LoanRequest = env
            .storage()
            .persistent()
            .get(&(symbol_short!("request"), request_id))
            .ok_or(ContractError::RequestNotFound)?;

        if request.status != RequestStatus::Open {
            return Err(ContractError::RequestNotOpen);
        }
        if *lender == request.borrower {
            return Err(ContractError::SelfFundingNotAllowed);
        }

        let rate_bps: u32 = env
            .storage()
            .instance()
            .get(&symbol_short!("rate_bps"))
            .unwrap_or(DEFAULT_RATE_BPS);
        let repayment = repayment_amount(request.principal, request.duration, rate_bps)?;

        let loan_id: u64 = env
            .storage()
            .instance()
            .get(&symbol_short!("next_ln"))
            .unwrap_or(1);

        let loan = Loan {
            loan_id,
            request_id,
            borrower: request.borrower.clone(),
            lender: lender.clone(),
            collateral_contract: request.collateral_contract.clone(),
            collateral_token_id: request.collateral_token_id,
            principal: request.principal,
            repayment_amount: repayment,
            currency_mode,
            start_ts: env.ledger().timestamp(),
            duration: request.duration,
            status: LoanStatus::Active,
        };

        request.status = RequestStatus::Fulfilled;
        env.storage()
            .persistent()
            .set(&(symbol_short!("request"), request_id), &request);
        env.storage().persistent().remove(&(
            symbol_short!("open_req"),
            request.collateral_contract.clone(),
            request.collateral_token_id,
        ));

        env.storage()
            .persistent()
            .set(&(symbol_short!("loan"), loan_id), &loan);
        env.storage().persistent().set(
            &(
                symbol_short!("act_loan"),
                request.collateral_contract.clone(),
                request.collateral_token_id,
            ),
            &loan_id,
        );
        env.storage()
            .instance()
            .set(&symbol_short!("next_ln"), &(loan_id + 1));

        push_id(
            env,
            (symbol_short!("brw_lns"), request.borrower.clone()),
            loan_id,
        );
        push_id(env, (symbol_short!("lnd_lns"), lender.clone()), loan_id);

        env.events().publish(
            (symbol_short!("loan_open"),),
            (
                loan_id,
                request_id,
                request.borrower.clone(),
                lender.clone(),
                request.principal,
                repayment,
            ),
        );

        // State is settled; pull the collateral into escrow.
        let vault: Address = env
            .storage()
            .instance()
            .get(&symbol_short!("vault"))
            .ok_or(ContractError::Unauthorized)?;
        let args: Vec<Val> = Vec::from_array(
            env,
            [
                request.collateral_contract.into_val(env),
                request.collateral_token_id.into_val(env),
                request.borrower.into_val(env),
            ],
        );
        env.invoke_contract::<Val>(&vault, &Symbol::new(env, "take_custody"), args);

        Ok(loan_id)
    }

    /// Shared repayment state transition for both currency modes.
    ///
    /// Marks the loan repaid and clears the active index before the caller
    /// performs the transfers.
    fn settle_repayment(
        env: &Env,
        loan_id: u64,
        currency_mode: CurrencyMode,
    ) -> Result<Loan, ContractError> {
        let mut loan: Loan = Self::loan(env, loan_id)?;

        if loan.status != LoanStatus::Active {
            return Err(ContractError::LoanNotActive);
        }
        if loan.currency_mode != currency_mode {
            return Err(ContractError::CurrencyMismatch);
        }

        loan.status = LoanStatus::Repaid;
        env.storage()
            .persistent()
            .set(&(symbol_short!("loan"), loan_id), &loan);
        env.storage().persistent().remove(&(
            symbol_short!("act_loan"),
            loan.collateral_contract.clone(),
            loan.collateral_token_id,
        ));

        env.events().publish(
            (symbol_short!("loan_rep"),),
            (loan_id, loan.repayment_amount),
        );

        Ok(loan)
    }

    fn release_collateral(env: &Env, loan: &Loan, to: &Address) -> Result<(), ContractError> {
        let vault: Address = env
            .storage()
            .instance()
            .get(&symbol_short!("vault"))
            .ok_or(ContractError::Unauthorized)?;
        let args: Vec<Val> = Vec::from_array(
            env,
            [
                loan.collateral_contract.clone().into_val(env),
                loan.collateral_token_id.into_val(env),
                to.clone().into_val(env),
            ],
        );
        env.invoke_contract::<Val>(&vault, &Symbol::new(env, "release_custody"), args);
        Ok(())
    }

    fn loan(env: &Env, loan_id: u64) -> Result<Loan, ContractError> {
        env.storage()
            .persistent()
            .get(&(symbol_short!("loan"), loan_id))
            .ok_or(ContractError::LoanNotFound)
    }

    fn loans_by_index(env: &Env, key: (Symbol, Address), status_filter: u32) -> Vec<Loan> {
        let ids: Vec<u64> = env.storage().persistent().get(&key).unwrap_or(vec![env]);

        let mut out = vec![env];
        for id in ids.iter() {
            let loan: Option<Loan> = env.storage().persistent().get(&(symbol_short!("loan"), id));
            if let Some(loan) = loan {
                if status_filter == 0 || status_filter == loan.status as u32 + 1 {
                    out.push_back(loan);
                }
            }
        }
        out
    }
}

/// Simple interest, floored: `principal + principal * rate * duration / year`.
/// Monotonic non-decreasing in both principal and duration, and never below
/// the principal, so a repayment can never undercut what was lent.
fn repayment_amount(principal: i128, duration: u64, rate_bps: u32) -> Result<i128, ContractError> {
    let interest = principal
        .checked_mul(rate_bps as i128)
        .ok_or(ContractError::MathOverflow)?
        .checked_mul(duration as i128)
        .ok_or(ContractError::MathOverflow)?
        / (SECONDS_PER_YEAR * BPS_DENOMINATOR);

    principal
        .checked_add(interest)
        .ok_or(ContractError::MathOverflow)
}

fn push_id(env: &Env, key: (Symbol, Address), id: u64) {
    let mut ids: Vec<u64> = env.storage().persistent().get(&key).unwrap_or(vec![env]);
    ids.push_back(id);
    env.storage().persistent().set(&key, &ids);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
