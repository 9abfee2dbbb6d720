//! ABI bindings for the contracts the oracle reads and writes.

use alloy::sol;

sol! {
    #[derive(Debug, PartialEq, Eq)]
    struct Policy {
        address user;
        uint256 premium;
        uint256 coverageAmount;
        uint256 purchaseTime;
        uint256 expiryTime;
        bool active;
        bool claimed;
    }

    interface IInsurancePool {
        function getPoolBalance() external view returns (uint256);
        function getUserPolicies(address user) external view returns (Policy[] memory);
        function oracle() external view returns (address);
        function executePayout(address user, uint256 policyId, uint256 spikeId) external;

        event PolicyPurchased(address indexed user, uint256 policyId, uint256 premium, uint256 coverage, uint256 expiryTime);
        event PayoutExecuted(address indexed user, uint256 policyId, uint256 spikeId, uint256 amount);
    }

    interface IERC20 {
        function balanceOf(address owner) external view returns (uint256);

        event Transfer(address indexed from, address indexed to, uint256 value);
    }

    interface AggregatorV3Interface {
        function latestRoundData() external view returns (
            uint80 roundId,
            int256 answer,
            uint256 startedAt,
            uint256 updatedAt,
            uint80 answeredInRound
        );
    }
}
