#![allow(clippy::extra_unused_lifetimes)]

use ethers::contract::abigen;

abigen!(
    Router,
    r#"[
        event SubscriptionStarted(bytes32 subscriptionHash, bytes32 productHash, address user, uint256 start, bytes subscriptionMetadata)
        event PaymentMade(bytes32 subscriptionHash, uint256 paymentNumber)
        event SubscriptionTerminated(bytes32 subscriptionHash)
        event InitiatorChanged(address merchant, address newInitiator)
        function products(bytes32 productHash) public view returns (address merchant, address token, uint256 amount, uint256 period, uint256 freeTrialLength, uint256 paymentPeriod, bytes metadata)
        function merchantSettings(address merchant) public view returns (address initiator)
        function makePayment(bytes32 subscriptionHash, uint256 compensationAtomic) public
    ]"#,
    event_derives(serde::Deserialize, serde::Serialize)
);

abigen!(
    Erc20,
    r#"[
        function decimals() public view returns (uint8)
        function symbol() public view returns (string)
        function balanceOf(address account) public view returns (uint256)
        function allowance(address owner, address spender) public view returns (uint256)
    ]"#
);
